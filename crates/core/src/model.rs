//! Desired units, observed resources, drift records and correction plans.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{ConfigDocument, FieldValue};
use crate::patch::Patch;
use crate::path::FieldPath;
use crate::types::{ResourceIdentity, ScopeId, UnitId};

/// Label set with unique keys.
pub type Labels = BTreeMap<String, String>;

/// How serious a divergence is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A failed or degraded live status without a field-level divergence.
    PossibleDrift,
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PossibleDrift => write!(f, "possible_drift"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Source-of-truth configuration record for one logical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUnit {
    pub id: UnitId,
    pub slug: String,
    pub scope: ScopeId,
    pub document: ConfigDocument,
    #[serde(default)]
    pub labels: Labels,
    /// Unit this one was cloned from, living in the upstream scope.
    #[serde(default)]
    pub upstream: Option<UnitId>,
    /// Registry revision, bumped on every update.
    #[serde(default)]
    pub version: u64,
}

impl DesiredUnit {
    /// Create a unit at version 0 with no labels or upstream.
    pub fn new(slug: impl Into<String>, scope: ScopeId, document: ConfigDocument) -> Self {
        Self {
            id: UnitId::new(),
            slug: slug.into(),
            scope,
            document,
            labels: Labels::new(),
            upstream: None,
            version: 0,
        }
    }

    /// Builder: add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder: set the upstream unit.
    #[must_use]
    pub const fn with_upstream(mut self, upstream: UnitId) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Clone this unit into a downstream scope, keeping it as the upstream.
    #[must_use]
    pub fn clone_into(&self, scope: ScopeId) -> Self {
        Self {
            id: UnitId::new(),
            slug: self.slug.clone(),
            scope,
            document: self.document.clone(),
            labels: self.labels.clone(),
            upstream: Some(self.id),
            version: 0,
        }
    }

    /// Live resource this unit is reconciled against.
    pub fn identity(&self, default_namespace: &str) -> ResourceIdentity {
        self.document.identity(default_namespace)
    }
}

/// Runtime-reported health of a live resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceStatus {
    Ready,
    Progressing,
    Failed {
        reason: String,
    },
    #[default]
    Unknown,
}

/// Live state of a resource, flattened to comparable field paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub identity: ResourceIdentity,
    #[serde(default)]
    pub labels: Labels,
    pub fields: BTreeMap<FieldPath, Value>,
    /// Last-seen revision marker reported by the cluster.
    pub revision: String,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl ObservedResource {
    /// Create an observed resource with no fields.
    pub fn new(identity: ResourceIdentity, revision: impl Into<String>) -> Self {
        Self {
            identity,
            labels: Labels::new(),
            fields: BTreeMap::new(),
            revision: revision.into(),
            status: ResourceStatus::Unknown,
        }
    }

    /// Flatten a live, Kubernetes-shaped document into observed fields.
    ///
    /// Every comparable field the document carries is recorded under its path.
    pub fn from_live_document(
        document: &ConfigDocument,
        default_namespace: &str,
        revision: impl Into<String>,
    ) -> Self {
        let mut observed = Self::new(document.identity(default_namespace), revision);
        observed.fields = document
            .schema()
            .comparable_fields()
            .into_iter()
            .map(|field| (field.path, field.desired))
            .collect();
        if let Some(labels) = document
            .as_value()
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
        {
            observed.labels = labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
        }
        observed.status = ResourceStatus::Ready;
        observed
    }

    /// Builder: set a field.
    #[must_use]
    pub fn with_field(mut self, path: FieldPath, value: Value) -> Self {
        self.fields.insert(path, value);
        self
    }

    /// Builder: set the status.
    #[must_use]
    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    /// Raw observed value at `path`.
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.fields.get(path)
    }
}

/// A single field-level divergence. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftRecord {
    pub unit: UnitId,
    pub scope: ScopeId,
    pub resource: ResourceIdentity,
    pub path: FieldPath,
    pub expected: FieldValue,
    pub actual: FieldValue,
    /// Desired document value at `path` exactly as declared; corrections restore it.
    pub restore: Value,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

impl DriftRecord {
    /// Whether this record can be corrected by patching desired state.
    pub const fn is_correctable(&self) -> bool {
        !matches!(self.severity, Severity::PossibleDrift)
    }
}

/// Who produced a correction plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Mechanical,
    Advisor,
}

/// Structural patch plus rationale that removes one or more drift records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPlan {
    pub unit: UnitId,
    pub scope: ScopeId,
    pub resource: ResourceIdentity,
    pub patch: Patch,
    pub explanation: String,
    pub origin: Vec<DriftRecord>,
    pub source: PlanSource,
}

/// Named mutable collection of unit ids, owned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSet {
    pub name: String,
    pub members: BTreeSet<UnitId>,
}

/// Named predicate over unit attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFilter {
    #[serde(default)]
    pub name: String,
    /// Every listed label must be present with exactly this value.
    #[serde(default)]
    pub label_equals: Labels,
    /// Every listed label must be present with one of these values.
    #[serde(default)]
    pub label_in: BTreeMap<String, BTreeSet<String>>,
    /// Restrict to these unit ids (set membership), when present.
    #[serde(default)]
    pub members: Option<BTreeSet<UnitId>>,
}

impl UnitFilter {
    /// A filter matching every unit.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter on label equality.
    pub fn labels(labels: Labels) -> Self {
        Self {
            label_equals: labels,
            ..Self::default()
        }
    }

    /// Builder: require membership in `set`.
    #[must_use]
    pub fn within(mut self, set: &UnitSet) -> Self {
        self.members = Some(set.members.clone());
        self
    }

    /// Whether `unit` satisfies the predicate.
    pub fn matches(&self, unit: &DesiredUnit) -> bool {
        let labels_equal = self
            .label_equals
            .iter()
            .all(|(key, value)| unit.labels.get(key) == Some(value));
        let labels_in = self.label_in.iter().all(|(key, allowed)| {
            unit.labels
                .get(key)
                .is_some_and(|value| allowed.contains(value))
        });
        let member = self
            .members
            .as_ref()
            .is_none_or(|members| members.contains(&unit.id));
        labels_equal && labels_in && member
    }
}

/// Scope plus predicate naming the units the engine monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredScope {
    pub scope: ScopeId,
    /// Namespace assumed for documents without `metadata.namespace`.
    pub namespace: String,
    pub filter: UnitFilter,
    /// Optional registry Set further restricting the monitored units.
    pub set: Option<String>,
}

impl MonitoredScope {
    /// Monitor every unit of `scope`.
    pub fn new(scope: ScopeId, namespace: impl Into<String>) -> Self {
        Self {
            scope,
            namespace: namespace.into(),
            filter: UnitFilter::all(),
            set: None,
        }
    }
}
