//! Configuration documents and the per-kind schemas the engine compares.
//!
//! A [`ConfigDocument`] keeps the full nested structure so structural patches
//! can be merged into it. Comparison never walks it ad hoc: the document is
//! projected onto a [`ResourceSchema`], a tagged union of the known resource
//! families, which lists exactly the fields that are monitored for drift.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::Severity;
use crate::patch::Patch;
use crate::path::{FieldPath, Segment};
use crate::types::{ResourceFamily, ResourceIdentity, ResourceKind};

/// Well-known comparable field paths.
pub mod paths {
    use super::{FieldPath, Segment};

    fn path_of(tokens: &[&str]) -> FieldPath {
        FieldPath::from_segments(tokens.iter().map(|t| Segment::from_token(t)).collect())
    }

    /// `spec.replicas`
    pub fn replicas() -> FieldPath {
        path_of(&["spec", "replicas"])
    }

    /// Image of the primary container.
    pub fn image() -> FieldPath {
        path_of(&["spec", "template", "spec", "containers", "0", "image"])
    }

    /// CPU request of the primary container.
    pub fn cpu_request() -> FieldPath {
        path_of(&[
            "spec", "template", "spec", "containers", "0", "resources", "requests", "cpu",
        ])
    }

    /// Memory request of the primary container.
    pub fn memory_request() -> FieldPath {
        path_of(&[
            "spec", "template", "spec", "containers", "0", "resources", "requests", "memory",
        ])
    }

    /// `spec.ports`
    pub fn ports() -> FieldPath {
        path_of(&["spec", "ports"])
    }

    /// `data`
    pub fn data() -> FieldPath {
        path_of(&["data"])
    }

    /// `data.<key>`
    pub fn data_key(key: &str) -> FieldPath {
        data().key(key)
    }

    /// Reported live status, used for possible-drift records.
    pub fn status() -> FieldPath {
        path_of(&["status"])
    }
}

/// Canonical comparable form of a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    IntegerList(Vec<i64>),
    Text(String),
    Absent,
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::IntegerList(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            Self::Text(text) => f.write_str(text),
            Self::Absent => f.write_str("<absent>"),
        }
    }
}

/// How a field is coerced before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Compared numerically; `"3"` equals `3`.
    Integer,
    /// Compared exactly as strings.
    Text,
    /// Order-insensitive list of integers (ports). Objects contribute their `port`.
    IntegerList,
}

impl FieldType {
    /// Coerce a raw document value into its comparable form.
    pub fn coerce(self, raw: &Value) -> FieldValue {
        if raw.is_null() {
            return FieldValue::Absent;
        }
        match self {
            Self::Integer => as_integer(raw).map_or_else(|| text_of(raw), FieldValue::Integer),
            Self::Text => text_of(raw),
            Self::IntegerList => raw
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|item| item.get("port").map_or_else(|| as_integer(item), as_integer))
                        .collect::<Option<Vec<i64>>>()
                })
                .map_or_else(
                    || text_of(raw),
                    |mut ports| {
                        ports.sort_unstable();
                        FieldValue::IntegerList(ports)
                    },
                ),
        }
    }
}

fn as_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| {
                    #[allow(clippy::cast_possible_truncation)]
                    let whole = f as i64;
                    whole
                })
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(raw: &Value) -> FieldValue {
    match raw {
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Null => FieldValue::Absent,
        other => FieldValue::Text(other.to_string()),
    }
}

/// One monitored field of a desired document.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparableField {
    pub path: FieldPath,
    pub field_type: FieldType,
    pub severity: Severity,
    /// Raw value as written in the desired document.
    pub desired: Value,
}

/// Monitored fields of a scalable workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadSchema {
    pub replicas: Option<Value>,
    pub image: Option<Value>,
    pub cpu_request: Option<Value>,
    pub memory_request: Option<Value>,
}

/// Monitored fields of a network endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointSchema {
    pub ports: Option<Value>,
}

/// Monitored fields of key/value configuration.
///
/// `data == None` means the document declares no data at all; such a config
/// map is outside the monitored scope and is not compared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValueSchema {
    pub data: Option<BTreeMap<String, Value>>,
}

/// Typed projection of a document onto its resource family.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSchema {
    Workload(WorkloadSchema),
    NetworkEndpoint(EndpointSchema),
    KeyValueConfig(KeyValueSchema),
    Opaque { kind: String },
}

impl ResourceSchema {
    /// Project a raw document of the given kind.
    pub fn project(kind: &ResourceKind, document: &Value) -> Self {
        let at = |path: FieldPath| path.get(document).filter(|v| !v.is_null()).cloned();
        match kind.family() {
            ResourceFamily::Workload => Self::Workload(WorkloadSchema {
                replicas: at(paths::replicas()),
                image: at(paths::image()),
                cpu_request: at(paths::cpu_request()),
                memory_request: at(paths::memory_request()),
            }),
            ResourceFamily::NetworkEndpoint => Self::NetworkEndpoint(EndpointSchema {
                ports: at(paths::ports()),
            }),
            ResourceFamily::KeyValueConfig => Self::KeyValueConfig(KeyValueSchema {
                data: paths::data()
                    .get(document)
                    .and_then(Value::as_object)
                    .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            }),
            ResourceFamily::Opaque => Self::Opaque {
                kind: kind.as_str().to_string(),
            },
        }
    }

    /// Whether this document takes part in comparison at all.
    pub const fn is_monitored(&self) -> bool {
        match self {
            Self::Workload(_) | Self::NetworkEndpoint(_) => true,
            Self::KeyValueConfig(schema) => schema.data.is_some(),
            Self::Opaque { .. } => false,
        }
    }

    /// Fields present in the document that are compared against live state.
    ///
    /// Fields absent from the document are never listed.
    pub fn comparable_fields(&self) -> Vec<ComparableField> {
        let field = |path: FieldPath, field_type, severity, desired: &Option<Value>| {
            desired.clone().map(|desired| ComparableField {
                path,
                field_type,
                severity,
                desired,
            })
        };

        match self {
            Self::Workload(w) => [
                field(paths::replicas(), FieldType::Integer, Severity::Warning, &w.replicas),
                field(paths::image(), FieldType::Text, Severity::Critical, &w.image),
                field(
                    paths::cpu_request(),
                    FieldType::Text,
                    Severity::Warning,
                    &w.cpu_request,
                ),
                field(
                    paths::memory_request(),
                    FieldType::Text,
                    Severity::Warning,
                    &w.memory_request,
                ),
            ]
            .into_iter()
            .flatten()
            .collect(),
            Self::NetworkEndpoint(e) => {
                field(paths::ports(), FieldType::IntegerList, Severity::Warning, &e.ports)
                    .into_iter()
                    .collect()
            }
            Self::KeyValueConfig(kv) => kv
                .data
                .iter()
                .flatten()
                .map(|(key, value)| ComparableField {
                    path: paths::data_key(key),
                    field_type: FieldType::Text,
                    severity: Severity::Info,
                    desired: value.clone(),
                })
                .collect(),
            Self::Opaque { .. } => Vec::new(),
        }
    }
}

/// Declarative configuration of one resource.
///
/// The document is Kubernetes-shaped: a `kind`, `metadata.name`, optional
/// `metadata.namespace`, and kind-specific body fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ConfigDocument(Value);

impl ConfigDocument {
    /// Wrap a raw document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDocument`] unless the value is an object with a
    /// string `kind` and a string `metadata.name`.
    pub fn new(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::invalid_document("document must be an object"));
        }
        if value.get("kind").and_then(Value::as_str).is_none() {
            return Err(Error::invalid_document("document has no string 'kind'"));
        }
        if value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(Error::invalid_document("document has no 'metadata.name'"));
        }
        Ok(Self(value))
    }

    /// Resource kind.
    pub fn kind(&self) -> ResourceKind {
        self.0
            .get("kind")
            .and_then(Value::as_str)
            .map(ResourceKind::from)
            .unwrap_or_else(|| ResourceKind::Other(String::new()))
    }

    /// `metadata.name`.
    pub fn name(&self) -> &str {
        self.0
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// `metadata.namespace`, if set.
    pub fn namespace(&self) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
    }

    /// Identity of the live resource this document describes.
    pub fn identity(&self, default_namespace: &str) -> ResourceIdentity {
        ResourceIdentity::new(
            self.kind(),
            self.namespace().unwrap_or(default_namespace),
            self.name(),
        )
    }

    /// Value at `path`.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        path.get(&self.0)
    }

    /// Raw document.
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Typed projection for comparison.
    pub fn schema(&self) -> ResourceSchema {
        ResourceSchema::project(&self.kind(), &self.0)
    }

    /// The document with `patch` merged in.
    ///
    /// # Errors
    ///
    /// Returns an error when the patch cannot be applied or removes the
    /// document's identity fields.
    pub fn patched(&self, patch: &Patch) -> Result<Self> {
        Self::new(patch.applied_to(&self.0)?)
    }
}

impl TryFrom<Value> for ConfigDocument {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ConfigDocument> for Value {
    fn from(document: ConfigDocument) -> Self {
        document.0
    }
}
