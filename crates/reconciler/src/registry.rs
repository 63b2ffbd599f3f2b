//! Desired-state registry collaborator.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use driftwatch_core::{
    DesiredUnit, Patch, ScopeId, ScopeTree, UnitFilter, UnitId, UnitSet,
};
use driftwatch_events::ClusterClient;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::propagation::{PropagationEngine, PropagationReport};

/// Registry operations the engine needs.
///
/// Errors distinguish not-found, version conflict and transport failure
/// through their [`driftwatch_core::ErrorClass`].
#[async_trait]
pub trait Registry: Send + Sync {
    /// Units of `scope` matching `filter`.
    async fn list_units(&self, scope: &ScopeId, filter: &UnitFilter) -> Result<Vec<DesiredUnit>>;

    async fn get_unit(&self, id: UnitId) -> Result<DesiredUnit>;

    /// Merge `patch` into the unit if it is still at `base_version`.
    ///
    /// A patch that changes nothing leaves the version untouched.
    async fn update_unit(&self, id: UnitId, base_version: u64, patch: &Patch)
    -> Result<DesiredUnit>;

    /// Push the unit's document to its live resource.
    async fn apply_unit(&self, id: UnitId) -> Result<()>;

    /// Patch every unit of `scope` matching `filter`, optionally pushing the
    /// change to downstream scopes.
    async fn bulk_patch(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
        patch: &Patch,
        propagate_downstream: bool,
    ) -> Result<Vec<PropagationReport>>;

    /// Units whose upstream reference is `id`.
    async fn downstream_units(&self, id: UnitId) -> Result<Vec<DesiredUnit>>;

    async fn scopes(&self) -> Result<ScopeTree>;

    async fn get_set(&self, name: &str) -> Result<UnitSet>;
}

#[derive(Default)]
struct RegistryState {
    units: BTreeMap<UnitId, DesiredUnit>,
    scopes: ScopeTree,
    sets: BTreeMap<String, UnitSet>,
}

/// In-process registry used by tests and fixture-driven runs.
///
/// When a cluster is attached, `apply_unit` pushes documents to it.
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    cluster: Option<(Arc<dyn ClusterClient>, String)>,
    failures: Mutex<VecDeque<Error>>,
    races: Mutex<BTreeSet<UnitId>>,
    updates: AtomicU64,
    applies: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new(scopes: ScopeTree) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                scopes,
                ..RegistryState::default()
            }),
            cluster: None,
            failures: Mutex::new(VecDeque::new()),
            races: Mutex::new(BTreeSet::new()),
            updates: AtomicU64::new(0),
            applies: AtomicU64::new(0),
        }
    }

    /// Attach the cluster `apply_unit` pushes to.
    #[must_use]
    pub fn with_cluster(
        mut self,
        cluster: Arc<dyn ClusterClient>,
        default_namespace: impl Into<String>,
    ) -> Self {
        self.cluster = Some((cluster, default_namespace.into()));
        self
    }

    /// Store a unit.
    ///
    /// # Errors
    ///
    /// Rejects units whose scope is unknown or whose upstream unit does not
    /// live in the scope's upstream scope.
    pub async fn insert_unit(&self, unit: DesiredUnit) -> Result<UnitId> {
        let mut state = self.state.write().await;
        if !state.scopes.contains(&unit.scope) {
            return Err(driftwatch_core::Error::scope_not_found(unit.scope.as_str()).into());
        }
        if let Some(upstream_id) = unit.upstream {
            let upstream = state
                .units
                .get(&upstream_id)
                .ok_or_else(|| Error::unit_not_found(upstream_id))?;
            let expected = state.scopes.upstream(&unit.scope);
            if expected != Some(&upstream.scope) {
                return Err(driftwatch_core::Error::UpstreamScopeMismatch {
                    unit: unit.slug.clone(),
                    expected: expected.map(ToString::to_string).unwrap_or_default(),
                    actual: upstream.scope.to_string(),
                }
                .into());
            }
        }
        let id = unit.id;
        debug!(unit = %id, slug = %unit.slug, scope = %unit.scope, "Unit stored");
        state.units.insert(id, unit);
        Ok(id)
    }

    /// Clone a unit into the scope directly downstream of its own.
    ///
    /// # Errors
    ///
    /// Fails for unknown units or scopes that are not downstream of the unit's.
    pub async fn clone_unit(&self, id: UnitId, scope: ScopeId) -> Result<DesiredUnit> {
        let source = self.snapshot(id).await.ok_or_else(|| Error::unit_not_found(id))?;
        let clone = source.clone_into(scope);
        self.insert_unit(clone.clone()).await?;
        Ok(clone)
    }

    /// Register a scope.
    ///
    /// # Errors
    ///
    /// See [`ScopeTree::add_scope`].
    pub async fn add_scope(&self, scope: ScopeId, upstream: Option<ScopeId>) -> Result<()> {
        Ok(self.state.write().await.scopes.add_scope(scope, upstream)?)
    }

    pub async fn put_set(&self, set: UnitSet) {
        self.state.write().await.sets.insert(set.name.clone(), set);
    }

    /// Read a unit without failure injection.
    pub async fn snapshot(&self, id: UnitId) -> Option<DesiredUnit> {
        self.state.read().await.units.get(&id).cloned()
    }

    /// Make the next registry call fail with `error`.
    pub async fn fail_next(&self, error: Error) {
        self.failures.lock().await.push_back(error);
    }

    /// Simulate a concurrent writer bumping `id` just before the next update.
    pub async fn race_next_update(&self, id: UnitId) {
        self.races.lock().await.insert(id);
    }

    /// Number of updates that changed a document.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of successful `apply_unit` calls.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    async fn injected(&self) -> Result<()> {
        self.failures.lock().await.pop_front().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_units(&self, scope: &ScopeId, filter: &UnitFilter) -> Result<Vec<DesiredUnit>> {
        self.injected().await?;
        let state = self.state.read().await;
        if !state.scopes.contains(scope) {
            return Err(driftwatch_core::Error::scope_not_found(scope.as_str()).into());
        }
        Ok(state
            .units
            .values()
            .filter(|unit| unit.scope == *scope && filter.matches(unit))
            .cloned()
            .collect())
    }

    async fn get_unit(&self, id: UnitId) -> Result<DesiredUnit> {
        self.injected().await?;
        self.snapshot(id).await.ok_or_else(|| Error::unit_not_found(id))
    }

    async fn update_unit(
        &self,
        id: UnitId,
        base_version: u64,
        patch: &Patch,
    ) -> Result<DesiredUnit> {
        self.injected().await?;
        let raced = self.races.lock().await.remove(&id);

        let mut state = self.state.write().await;
        let unit = state
            .units
            .get_mut(&id)
            .ok_or_else(|| Error::unit_not_found(id))?;
        if raced {
            unit.version = unit.version.saturating_add(1);
        }
        if unit.version != base_version {
            return Err(Error::version_conflict(id, base_version, unit.version));
        }

        let patched = unit.document.patched(patch)?;
        if patched != unit.document {
            unit.document = patched;
            unit.version = unit.version.saturating_add(1);
            self.updates.fetch_add(1, Ordering::SeqCst);
            debug!(unit = %id, version = unit.version, "Unit updated");
        }
        Ok(unit.clone())
    }

    async fn apply_unit(&self, id: UnitId) -> Result<()> {
        self.injected().await?;
        let unit = self.snapshot(id).await.ok_or_else(|| Error::unit_not_found(id))?;
        if let Some((cluster, namespace)) = &self.cluster {
            cluster.apply(&unit.document, namespace).await?;
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_patch(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
        patch: &Patch,
        propagate_downstream: bool,
    ) -> Result<Vec<PropagationReport>> {
        let units = self.list_units(scope, filter).await?;
        info!(
            scope = %scope,
            units = units.len(),
            propagate_downstream,
            "Bulk patch"
        );
        let engine = PropagationEngine::default().propagate_downstream(propagate_downstream);
        let mut reports = Vec::with_capacity(units.len());
        for unit in units {
            reports.push(engine.run(self, unit.id, patch).await);
        }
        Ok(reports)
    }

    async fn downstream_units(&self, id: UnitId) -> Result<Vec<DesiredUnit>> {
        self.injected().await?;
        Ok(self
            .state
            .read()
            .await
            .units
            .values()
            .filter(|unit| unit.upstream == Some(id))
            .cloned()
            .collect())
    }

    async fn scopes(&self) -> Result<ScopeTree> {
        self.injected().await?;
        Ok(self.state.read().await.scopes.clone())
    }

    async fn get_set(&self, name: &str) -> Result<UnitSet> {
        self.injected().await?;
        self.state
            .read()
            .await
            .sets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SetNotFound {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use driftwatch_core::{ConfigDocument, FieldPath, Labels};
    use serde_json::json;

    use super::*;

    fn deployment() -> ConfigDocument {
        ConfigDocument::new(json!({
            "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "shop"},
            "spec": {"replicas": 3}
        }))
        .unwrap()
    }

    fn replicas(n: i64) -> Patch {
        Patch::single(FieldPath::parse("spec.replicas").unwrap(), json!(n))
    }

    async fn registry() -> (InMemoryRegistry, UnitId) {
        let registry = InMemoryRegistry::new(ScopeTree::chain(["base", "dev"]).unwrap());
        let unit = DesiredUnit::new("api", ScopeId::from("base"), deployment())
            .with_label("team", "shop");
        let id = registry.insert_unit(unit).await.unwrap();
        (registry, id)
    }

    #[tokio::test]
    async fn test_update_bumps_version_only_on_change() {
        let (registry, id) = registry().await;

        let unchanged = registry.update_unit(id, 0, &replicas(3)).await.unwrap();
        assert_eq!(unchanged.version, 0);

        let changed = registry.update_unit(id, 0, &replicas(4)).await.unwrap();
        assert_eq!(changed.version, 1);
        assert_eq!(registry.update_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let (registry, id) = registry().await;
        registry.update_unit(id, 0, &replicas(4)).await.unwrap();

        let stale = registry.update_unit(id, 0, &replicas(5)).await;
        assert!(matches!(stale, Err(Error::VersionConflict { actual: 1, .. })));
    }

    #[tokio::test]
    async fn test_race_forces_one_conflict() {
        let (registry, id) = registry().await;
        registry.race_next_update(id).await;

        assert!(registry.update_unit(id, 0, &replicas(4)).await.is_err());
        let current = registry.get_unit(id).await.unwrap();
        assert!(
            registry
                .update_unit(id, current.version, &replicas(4))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_list_applies_filter() {
        let (registry, _) = registry().await;
        let filter = UnitFilter::labels(Labels::from([("team".to_string(), "ops".to_string())]));
        let none = registry
            .list_units(&ScopeId::from("base"), &filter)
            .await
            .unwrap();
        assert!(none.is_empty());
        let all = registry
            .list_units(&ScopeId::from("base"), &UnitFilter::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_must_live_in_upstream_scope() {
        let (registry, id) = registry().await;
        let stray = DesiredUnit::new("api", ScopeId::from("base"), deployment()).with_upstream(id);
        assert!(registry.insert_unit(stray).await.is_err());

        let clone = registry.clone_unit(id, ScopeId::from("dev")).await.unwrap();
        assert_eq!(clone.upstream, Some(id));
        assert_eq!(registry.downstream_units(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_set_is_not_found() {
        let (registry, _) = registry().await;
        assert!(matches!(
            registry.get_set("canaries").await,
            Err(Error::SetNotFound { .. })
        ));
    }
}
