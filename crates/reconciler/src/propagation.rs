//! Push-upgrade propagation of a patch through the scope hierarchy.
//!
//! A run merges the patch into the origin unit and applies it live, then
//! walks the origin's downstream copies breadth-first in scope creation
//! order. A downstream field is a local override when its value differs from
//! both its immediate upstream's value and the origin's value, as they stood
//! before the patch. Overridden fields are skipped for that scope and the
//! walk continues past it. Scopes the walk cannot reach because the registry
//! failed are recorded as unreachable and fail the run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use driftwatch_core::{
    Classify, DesiredUnit, ErrorClass, FieldPath, Patch, ScopeId, ScopeTree, UnitId,
};
use driftwatch_events::{RetryPolicy, retry_transient};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::Registry;

/// Propagation run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PropagationState {
    Idle,
    Applying { origin: ScopeId },
    Propagating { remaining: VecDeque<ScopeId> },
    Done,
    Failed { reason: String },
}

impl PropagationState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

/// What happened to one scope during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScopeOutcome {
    /// Every patched field was merged.
    Patched,
    /// Some fields were merged; the listed ones are local overrides.
    PartiallyPatched { skipped: Vec<FieldPath> },
    /// Every field is a local override; nothing was merged.
    Skipped { skipped: Vec<FieldPath> },
    /// The unit already carried the patch.
    Unchanged,
    /// The scope holds no copy of the unit.
    NoUnit,
    /// The registry failed before the walk reached this scope.
    Unreachable { reason: String },
    Failed { reason: String },
}

impl ScopeOutcome {
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Unreachable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeResult {
    pub scope: ScopeId,
    pub unit: Option<UnitId>,
    pub outcome: ScopeOutcome,
}

/// Full record of one propagation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub origin: UnitId,
    pub origin_scope: Option<ScopeId>,
    /// Current state.
    pub state: PropagationState,
    /// Every state entered, in order. Starts at `Idle`.
    pub transitions: Vec<PropagationState>,
    /// Scopes in visit order, the origin first.
    pub scopes: Vec<ScopeResult>,
    /// Partial-propagation and failure notes.
    pub notes: Vec<String>,
}

impl PropagationReport {
    fn new(origin: UnitId) -> Self {
        Self {
            origin,
            origin_scope: None,
            state: PropagationState::Idle,
            transitions: vec![PropagationState::Idle],
            scopes: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn enter(&mut self, state: PropagationState) {
        debug!(unit = %self.origin, state = ?state, "Propagation transition");
        self.state = state.clone();
        self.transitions.push(state);
    }

    fn fail(mut self, reason: String) -> Self {
        warn!(unit = %self.origin, reason = %reason, "Propagation failed");
        self.notes.push(reason.clone());
        self.enter(PropagationState::Failed { reason });
        self
    }

    pub const fn succeeded(&self) -> bool {
        matches!(self.state, PropagationState::Done)
    }

    /// Result recorded for `scope`.
    pub fn outcome(&self, scope: &ScopeId) -> Option<&ScopeOutcome> {
        self.scopes
            .iter()
            .find(|result| result.scope == *scope)
            .map(|result| &result.outcome)
    }
}

/// Runs push-upgrades against a registry.
#[derive(Debug, Clone, Copy)]
pub struct PropagationEngine {
    propagate_downstream: bool,
    conflict_retries: u32,
    retry: RetryPolicy,
}

impl Default for PropagationEngine {
    fn default() -> Self {
        Self {
            propagate_downstream: true,
            conflict_retries: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl PropagationEngine {
    #[must_use]
    pub const fn propagate_downstream(mut self, enabled: bool) -> Self {
        self.propagate_downstream = enabled;
        self
    }

    /// Backoff for transient registry failures.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Merge `patch` into `origin`, apply it live, then push it downstream.
    ///
    /// Never returns an error: failures are recorded in the report. The
    /// origin apply failing ends the run in `Failed`, as does any downstream
    /// scope left unreachable. A failed downstream update is recorded for
    /// its scope and the walk continues.
    pub async fn run(
        &self,
        registry: &dyn Registry,
        origin: UnitId,
        patch: &Patch,
    ) -> PropagationReport {
        let mut report = PropagationReport::new(origin);

        let unit = match self.fetch(registry, origin).await {
            Ok(unit) => unit,
            Err(err) => return report.fail(format!("origin unit {origin} unavailable: {err}")),
        };
        report.origin_scope = Some(unit.scope.clone());
        report.enter(PropagationState::Applying {
            origin: unit.scope.clone(),
        });

        let origin_before = unit.document.as_value().clone();
        let outcome = match self.apply_origin(registry, unit.clone(), patch).await {
            Ok(outcome) => outcome,
            Err(err) => {
                report.scopes.push(ScopeResult {
                    scope: unit.scope.clone(),
                    unit: Some(origin),
                    outcome: ScopeOutcome::Failed {
                        reason: err.to_string(),
                    },
                });
                return report.fail(format!("origin apply in '{}' failed: {err}", unit.scope));
            }
        };
        info!(unit = %origin, scope = %unit.scope, outcome = ?outcome, "Origin applied");
        report.scopes.push(ScopeResult {
            scope: unit.scope.clone(),
            unit: Some(origin),
            outcome,
        });

        if !self.propagate_downstream {
            report.enter(PropagationState::Done);
            return report;
        }

        let listed = retry_transient(&self.retry, "registry.scopes", || registry.scopes()).await;
        let tree = match listed {
            Ok(tree) => tree,
            Err(err) => {
                return report.fail(format!(
                    "scope hierarchy unavailable, downstream of '{}' not visited: {err}",
                    unit.scope
                ));
            }
        };
        let order = tree.descendants(&unit.scope);
        report.enter(PropagationState::Propagating {
            remaining: order.iter().cloned().collect(),
        });

        let origin_node = (origin, unit.scope.clone(), origin_before);
        let unreachable = self
            .walk(registry, &tree, &mut report, &order, origin_node, patch)
            .await;

        let mut missed = Vec::new();
        for scope in &order {
            if report.outcome(scope).is_some() {
                continue;
            }
            let outcome = match unreachable.get(scope) {
                Some(reason) => {
                    missed.push(scope.to_string());
                    ScopeOutcome::Unreachable {
                        reason: reason.clone(),
                    }
                }
                None => ScopeOutcome::NoUnit,
            };
            report.scopes.push(ScopeResult {
                scope: scope.clone(),
                unit: None,
                outcome,
            });
        }
        if !missed.is_empty() {
            return report.fail(format!(
                "downstream scopes not visited: {}",
                missed.join(", ")
            ));
        }
        report.enter(PropagationState::Done);
        report
    }

    async fn fetch(&self, registry: &dyn Registry, id: UnitId) -> Result<DesiredUnit> {
        retry_transient(&self.retry, "registry.get_unit", || registry.get_unit(id)).await
    }

    async fn apply_origin(
        &self,
        registry: &dyn Registry,
        unit: DesiredUnit,
        patch: &Patch,
    ) -> Result<ScopeOutcome> {
        let id = unit.id;
        let outcome = if patch.is_satisfied_by(unit.document.as_value()) {
            ScopeOutcome::Unchanged
        } else {
            self.update(registry, unit, patch).await?;
            ScopeOutcome::Patched
        };
        retry_transient(&self.retry, "registry.apply_unit", || registry.apply_unit(id)).await?;
        Ok(outcome)
    }

    /// Breadth-first walk from the origin. Returns the scopes cut off by a
    /// registry failure, with the reason.
    async fn walk(
        &self,
        registry: &dyn Registry,
        tree: &ScopeTree,
        report: &mut PropagationReport,
        order: &[ScopeId],
        (origin, origin_scope, origin_before): (UnitId, ScopeId, Value),
        patch: &Patch,
    ) -> BTreeMap<ScopeId, String> {
        let rank = |scope: &ScopeId| order.iter().position(|s| s == scope).unwrap_or(usize::MAX);
        let mut unreachable = BTreeMap::new();
        let mut visited = BTreeSet::from([origin]);
        let mut queue = VecDeque::from([(origin, origin_scope, origin_before.clone())]);

        while let Some((parent, parent_scope, parent_before)) = queue.pop_front() {
            let listed = retry_transient(&self.retry, "registry.downstream_units", || {
                registry.downstream_units(parent)
            })
            .await;
            let mut children = match listed {
                Ok(children) => children,
                Err(err) => {
                    warn!(
                        unit = %parent,
                        scope = %parent_scope,
                        error = %err,
                        "Downstream walk cut off"
                    );
                    report
                        .notes
                        .push(format!("downstream of '{parent_scope}' unavailable: {err}"));
                    for scope in tree.descendants(&parent_scope) {
                        unreachable.entry(scope).or_insert_with(|| err.to_string());
                    }
                    continue;
                }
            };
            children.sort_by_key(|child| rank(&child.scope));

            for child in children {
                if !visited.insert(child.id) {
                    continue;
                }
                let child_before = child.document.as_value().clone();
                let scope = child.scope.clone();
                let id = child.id;

                let outcome = self
                    .propagate_to(registry, child, &parent_before, &origin_before, patch)
                    .await;
                match &outcome {
                    ScopeOutcome::PartiallyPatched { skipped } | ScopeOutcome::Skipped { skipped } => {
                        let paths: Vec<String> = skipped.iter().map(ToString::to_string).collect();
                        info!(scope = %scope, unit = %id, paths = ?paths, "Local override kept");
                        report.notes.push(format!(
                            "scope '{scope}' keeps local override on {}",
                            paths.join(", ")
                        ));
                    }
                    ScopeOutcome::Failed { reason } => {
                        warn!(scope = %scope, unit = %id, reason = %reason, "Downstream patch failed");
                        report
                            .notes
                            .push(format!("scope '{scope}' not patched: {reason}"));
                    }
                    _ => debug!(scope = %scope, unit = %id, outcome = ?outcome, "Scope visited"),
                }
                report.scopes.push(ScopeResult {
                    scope: scope.clone(),
                    unit: Some(id),
                    outcome,
                });
                queue.push_back((id, scope, child_before));
            }
        }
        unreachable
    }

    async fn propagate_to(
        &self,
        registry: &dyn Registry,
        child: DesiredUnit,
        parent_before: &Value,
        origin_before: &Value,
        patch: &Patch,
    ) -> ScopeOutcome {
        let current = child.document.as_value();
        let skipped: Vec<FieldPath> = patch
            .entries()
            .filter(|(path, value)| {
                let local = path.get(current);
                local != Some(*value)
                    && local != path.get(parent_before)
                    && local != path.get(origin_before)
            })
            .map(|(path, _)| path.clone())
            .collect();

        let effective = patch.filtered(|path| !skipped.contains(path));
        if effective.is_empty() {
            return ScopeOutcome::Skipped { skipped };
        }
        if effective.is_satisfied_by(current) {
            return if skipped.is_empty() {
                ScopeOutcome::Unchanged
            } else {
                ScopeOutcome::Skipped { skipped }
            };
        }

        match self.update(registry, child, &effective).await {
            Ok(_) if skipped.is_empty() => ScopeOutcome::Patched,
            Ok(_) => ScopeOutcome::PartiallyPatched { skipped },
            Err(err) => ScopeOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }

    /// Update with a re-fetch and retry on version conflict. Transient
    /// failures are retried with backoff.
    async fn update(
        &self,
        registry: &dyn Registry,
        mut unit: DesiredUnit,
        patch: &Patch,
    ) -> Result<DesiredUnit> {
        let mut retries = 0;
        loop {
            let (id, version) = (unit.id, unit.version);
            let attempt = retry_transient(&self.retry, "registry.update_unit", || {
                registry.update_unit(id, version, patch)
            })
            .await;
            match attempt {
                Ok(updated) => return Ok(updated),
                Err(err) if err.class() == ErrorClass::Conflict && retries < self.conflict_retries => {
                    retries += 1;
                    warn!(unit = %id, error = %err, "Version conflict, re-fetching");
                    unit = self.fetch(registry, id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
