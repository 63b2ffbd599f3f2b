//! BDD tests: drift detection, correction and push-upgrade end-to-end.
//!
//! **Scenario:** GIVEN desired units in a registry and live resources in a
//! cluster WHEN a reconciliation cycle runs THEN every divergence is reported
//! and, with auto-correct, restored without touching healthy resources.
//!
//! All collaborators are the in-memory implementations.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use async_trait::async_trait;
use driftwatch_core::document::paths;
use driftwatch_core::{
    ConfigDocument, DesiredUnit, FieldPath, FieldValue, MonitoredScope, ObservedResource, Patch,
    PlanSource, ScopeId, ScopeTree, ShutdownCoordinator, UnitFilter, UnitId,
};
use driftwatch_events::{InMemoryCluster, RetryPolicy};
use driftwatch_reconciler::{
    Advisor, AnalysisSource, CallBounds, Error, InMemoryRegistry, ItemStatus, ReconcileContext,
    ReconcilerBuilder, Registry, Result, ScopeOutcome, WorkKey,
};
use serde_json::{Value, json};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn deployment(name: &str, replicas: i64) -> ConfigDocument {
    ConfigDocument::new(json!({
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "shop"},
        "spec": {
            "replicas": replicas,
            "template": {"spec": {"containers": [{"name": name, "image": "shop/api:1.4"}]}}
        }
    }))
    .unwrap()
}

fn config_map(level: &str) -> ConfigDocument {
    ConfigDocument::new(json!({
        "kind": "ConfigMap",
        "metadata": {"name": "app-config", "namespace": "shop"},
        "data": {"log_level": level, "timeout": "30s"}
    }))
    .unwrap()
}

fn log_level() -> FieldPath {
    paths::data_key("log_level")
}

struct World {
    cluster: Arc<InMemoryCluster>,
    registry: Arc<InMemoryRegistry>,
}

impl World {
    fn new(scopes: &[&str]) -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        let registry = Arc::new(
            InMemoryRegistry::new(ScopeTree::chain(scopes.iter().copied()).unwrap())
                .with_cluster(cluster.clone(), "default"),
        );
        Self { cluster, registry }
    }

    /// Register `document` at `scope` and publish it live with `drift` applied.
    async fn unit(&self, scope: &str, document: ConfigDocument, drift: &[(FieldPath, Value)]) -> UnitId {
        let slug = document.name().to_string();
        let id = self
            .registry
            .insert_unit(DesiredUnit::new(slug, ScopeId::from(scope), document.clone()))
            .await
            .unwrap();
        let live = drift.iter().fold(
            ObservedResource::from_live_document(&document, "default", "0"),
            |live, (path, value)| live.with_field(path.clone(), value.clone()),
        );
        self.cluster.upsert(live).await;
        id
    }

    fn context(&self, scope: &str, registry: Arc<dyn Registry>) -> ReconcileContext {
        ReconcileContext::new(
            MonitoredScope::new(ScopeId::from(scope), "default"),
            registry,
            self.cluster.clone(),
            Arc::new(ShutdownCoordinator::new()),
            CallBounds {
                retry: RetryPolicy::new(2, 1, 1).without_jitter(),
                ..CallBounds::default()
            },
        )
    }
}

#[tokio::test]
async fn given_replicas_3_observed_5_when_cycle_runs_then_one_record_and_replica_plan() -> TestResult {
    // Given: desired replicas 3, live replicas 5
    let world = World::new(&["base"]);
    world
        .unit("base", deployment("api", 3), &[(paths::replicas(), json!(5))])
        .await;
    let ctx = world.context("base", world.registry.clone());
    let reconciler = ReconcilerBuilder::new().build()?;

    // When: a dry-run cycle runs
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: exactly one record on spec.replicas, expected 3, actual 5
    assert_eq!(report.drift_count(), 1);
    let item = &report.items[0];
    assert_eq!(item.field.to_string(), "spec.replicas");
    assert_eq!(item.expected.to_string(), "3");
    assert_eq!(item.actual.to_string(), "5");
    assert_eq!(item.status, ItemStatus::Planned);

    // And: the plan patches spec.replicas back to 3
    assert_eq!(report.plans.len(), 1);
    assert_eq!(report.plans[0].patch.get(&paths::replicas()), Some(&json!(3)));
    assert_eq!(report.summary, "1 drift items detected across 1 units");
    assert_eq!(world.registry.apply_count(), 0);
    Ok(())
}

#[tokio::test]
async fn given_log_level_info_observed_debug_when_auto_correct_then_info_is_restored() -> TestResult {
    // Given: a ConfigMap declaring log_level info, edited live to debug
    let world = World::new(&["base"]);
    world
        .unit("base", config_map("info"), &[(log_level(), json!("debug"))])
        .await;
    let ctx = world.context("base", world.registry.clone());
    let reconciler = ReconcilerBuilder::new().auto_correct(true).build()?;

    // When: a cycle runs with auto-correct
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: one record on data.log_level, corrected
    assert_eq!(report.drift_count(), 1);
    assert_eq!(report.items[0].field, log_level());
    assert_eq!(report.items[0].expected, FieldValue::Text("info".to_string()));
    assert_eq!(report.items[0].status, ItemStatus::Corrected);
    assert_eq!(report.corrections_applied, 1);

    // And: the live resource is back to info
    let identity = report.items[0].resource.clone();
    let live = world.cluster.snapshot(&identity).await.unwrap();
    assert_eq!(live.field(&log_level()), Some(&json!("info")));
    Ok(())
}

#[tokio::test]
async fn given_staging_override_when_base_correction_propagates_then_dev_and_prod_patched() -> TestResult {
    // Given: base -> dev -> staging -> prod, staging overriding log_level
    let world = World::new(&["base", "dev", "staging", "prod"]);
    let base = world.unit("base", config_map("warn"), &[]).await;
    let dev = world.registry.clone_unit(base, ScopeId::from("dev")).await?;
    let staging = world.registry.clone_unit(dev.id, ScopeId::from("staging")).await?;
    let prod = world.registry.clone_unit(staging.id, ScopeId::from("prod")).await?;
    world
        .registry
        .update_unit(staging.id, staging.version, &Patch::single(log_level(), json!("debug")))
        .await?;

    // When: a correction is bulk-applied at base with propagation
    let reports = world
        .registry
        .bulk_patch(
            &ScopeId::from("base"),
            &UnitFilter::all(),
            &Patch::single(log_level(), json!("info")),
            true,
        )
        .await?;

    // Then: dev and prod receive the patch, staging keeps its override
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.succeeded());
    let level = |unit: Option<DesiredUnit>| unit.unwrap().document.get(&log_level()).cloned();
    assert_eq!(level(world.registry.snapshot(base).await), Some(json!("info")));
    assert_eq!(level(world.registry.snapshot(dev.id).await), Some(json!("info")));
    assert_eq!(level(world.registry.snapshot(staging.id).await), Some(json!("debug")));
    assert_eq!(level(world.registry.snapshot(prod.id).await), Some(json!("info")));

    // And: the skip is recorded and the walk still reached prod
    assert!(matches!(
        report.outcome(&ScopeId::from("staging")),
        Some(ScopeOutcome::Skipped { .. })
    ));
    assert_eq!(
        report.outcome(&ScopeId::from("prod")),
        Some(&ScopeOutcome::Patched)
    );
    assert!(report.notes.iter().any(|note| note.contains("staging")));
    Ok(())
}

struct Garbled;

#[async_trait]
impl Advisor for Garbled {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok("Sure! Here is what I think: {summary: replicas are off".to_string())
    }
}

#[tokio::test]
async fn given_malformed_advisor_output_when_cycle_runs_then_mechanical_analysis_is_used() -> TestResult {
    // Given: drift and an advisor that returns garbage
    let world = World::new(&["base"]);
    world
        .unit("base", deployment("api", 3), &[(paths::replicas(), json!(5))])
        .await;
    let ctx = world.context("base", world.registry.clone());
    let reconciler = ReconcilerBuilder::new()
        .with_advisor(Arc::new(Garbled), std::time::Duration::from_secs(5))
        .build()?;

    // When: a cycle runs
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: drift is still reported with the mechanical summary and plan
    assert_eq!(report.analysis, AnalysisSource::Fallback);
    assert_eq!(report.summary, "1 drift items detected across 1 units");
    assert_eq!(report.plans.len(), 1);
    assert_eq!(report.plans[0].patch.get(&paths::replicas()), Some(&json!(3)));
    Ok(())
}

#[tokio::test]
async fn given_missing_live_resource_when_cycle_runs_then_it_is_skipped_not_failed() -> TestResult {
    // Given: two units, only one of which exists live
    let world = World::new(&["base"]);
    world
        .unit("base", deployment("api", 3), &[(paths::replicas(), json!(4))])
        .await;
    world
        .registry
        .insert_unit(DesiredUnit::new("ghost", ScopeId::from("base"), deployment("ghost", 1)))
        .await?;
    let ctx = world.context("base", world.registry.clone());
    let reconciler = ReconcilerBuilder::new().build()?;

    // When: a sweep runs
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: the missing one is skipped and the other still reported
    assert_eq!(report.units_checked, 2);
    assert_eq!(report.drift_count(), 1);
    assert!(!report.has_failures());
    assert!(report.skipped.iter().any(|s| s.contains("ghost")));
    Ok(())
}

#[tokio::test]
async fn given_concurrent_registry_writer_when_correction_lands_then_conflict_is_retried() -> TestResult {
    // Given: a unit whose next update loses a race
    let world = World::new(&["base"]);
    let id = world.unit("base", config_map("warn"), &[]).await;
    world.registry.race_next_update(id).await;

    // When: a patch is bulk-applied
    let reports = world
        .registry
        .bulk_patch(
            &ScopeId::from("base"),
            &UnitFilter::all(),
            &Patch::single(log_level(), json!("info")),
            false,
        )
        .await?;

    // Then: the update was retried once after a re-fetch and succeeded
    assert!(reports[0].succeeded());
    let unit = world.registry.snapshot(id).await.unwrap();
    assert_eq!(unit.document.get(&log_level()), Some(&json!("info")));
    assert_eq!(world.registry.update_count(), 1);
    Ok(())
}

/// Registry whose `apply_unit` fails for one unit.
struct FailingApply {
    inner: Arc<InMemoryRegistry>,
    broken: UnitId,
}

#[async_trait]
impl Registry for FailingApply {
    async fn list_units(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
    ) -> Result<Vec<DesiredUnit>> {
        self.inner.list_units(scope, filter).await
    }

    async fn get_unit(&self, id: UnitId) -> Result<DesiredUnit> {
        self.inner.get_unit(id).await
    }

    async fn update_unit(&self, id: UnitId, base_version: u64, patch: &Patch) -> Result<DesiredUnit> {
        self.inner.update_unit(id, base_version, patch).await
    }

    async fn apply_unit(&self, id: UnitId) -> Result<()> {
        if id == self.broken {
            return Err(Error::registry_unavailable("apply_unit", "connection reset"));
        }
        self.inner.apply_unit(id).await
    }

    async fn bulk_patch(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
        patch: &Patch,
        propagate_downstream: bool,
    ) -> Result<Vec<driftwatch_reconciler::PropagationReport>> {
        self.inner
            .bulk_patch(scope, filter, patch, propagate_downstream)
            .await
    }

    async fn downstream_units(&self, id: UnitId) -> Result<Vec<DesiredUnit>> {
        self.inner.downstream_units(id).await
    }

    async fn scopes(&self) -> Result<ScopeTree> {
        self.inner.scopes().await
    }

    async fn get_set(&self, name: &str) -> Result<driftwatch_core::UnitSet> {
        self.inner.get_set(name).await
    }
}

#[tokio::test]
async fn given_one_correction_fails_when_cycle_runs_then_others_still_apply() -> TestResult {
    // Given: two drifted deployments, one whose apply always fails
    let world = World::new(&["base"]);
    let broken = world
        .unit("base", deployment("api", 3), &[(paths::replicas(), json!(5))])
        .await;
    world
        .unit("base", deployment("worker", 2), &[(paths::replicas(), json!(9))])
        .await;
    let registry = Arc::new(FailingApply {
        inner: world.registry.clone(),
        broken,
    });
    let ctx = world.context("base", registry);
    let reconciler = ReconcilerBuilder::new().auto_correct(true).build()?;

    // When: a cycle runs with auto-correct
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: the healthy unit is corrected and the broken one marked failed
    assert_eq!(report.drift_count(), 2);
    assert_eq!(report.corrections_applied, 1);
    assert!(report.has_failures());
    let status_of = |unit: UnitId| {
        report
            .items
            .iter()
            .find(|item| item.unit == unit)
            .map(|item| item.status.clone())
            .unwrap()
    };
    assert!(matches!(status_of(broken), ItemStatus::Failed { .. }));
    let worker = report.items.iter().find(|item| item.unit != broken).unwrap();
    assert_eq!(worker.status, ItemStatus::Corrected);

    let live = world.cluster.snapshot(&worker.resource).await.unwrap();
    assert_eq!(live.field(&paths::replicas()), Some(&json!(2)));
    Ok(())
}

/// Registry whose downstream listing is always unavailable.
struct CutOffDownstream {
    inner: Arc<InMemoryRegistry>,
}

#[async_trait]
impl Registry for CutOffDownstream {
    async fn list_units(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
    ) -> Result<Vec<DesiredUnit>> {
        self.inner.list_units(scope, filter).await
    }

    async fn get_unit(&self, id: UnitId) -> Result<DesiredUnit> {
        self.inner.get_unit(id).await
    }

    async fn update_unit(&self, id: UnitId, base_version: u64, patch: &Patch) -> Result<DesiredUnit> {
        self.inner.update_unit(id, base_version, patch).await
    }

    async fn apply_unit(&self, id: UnitId) -> Result<()> {
        self.inner.apply_unit(id).await
    }

    async fn bulk_patch(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
        patch: &Patch,
        propagate_downstream: bool,
    ) -> Result<Vec<driftwatch_reconciler::PropagationReport>> {
        self.inner
            .bulk_patch(scope, filter, patch, propagate_downstream)
            .await
    }

    async fn downstream_units(&self, _id: UnitId) -> Result<Vec<DesiredUnit>> {
        Err(Error::registry_unavailable("downstream_units", "connection reset"))
    }

    async fn scopes(&self) -> Result<ScopeTree> {
        self.inner.scopes().await
    }

    async fn get_set(&self, name: &str) -> Result<driftwatch_core::UnitSet> {
        self.inner.get_set(name).await
    }
}

#[tokio::test]
async fn given_downstream_listing_fails_when_correction_propagates_then_item_is_failed() -> TestResult {
    // Given: base -> dev, a drifted base unit, and a registry that cannot list copies
    let world = World::new(&["base", "dev"]);
    let base = world
        .unit("base", config_map("info"), &[(log_level(), json!("debug"))])
        .await;
    let dev = world.registry.clone_unit(base, ScopeId::from("dev")).await?;
    let ctx = world.context(
        "base",
        Arc::new(CutOffDownstream {
            inner: world.registry.clone(),
        }),
    );
    let reconciler = ReconcilerBuilder::new().auto_correct(true).build()?;

    // When: a cycle runs with auto-correct
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: the item is failed and names the scope that was never visited
    assert!(report.has_failures());
    assert_eq!(report.corrections_applied, 0);
    let ItemStatus::Failed { reason } = &report.items[0].status else {
        return Err(format!("expected a failed item, got {}", report.items[0].status).into());
    };
    assert!(reason.contains("dev"));

    // And: the dev copy was left untouched
    let copy = world.registry.snapshot(dev.id).await.unwrap();
    assert_eq!(copy.document.get(&log_level()), Some(&json!("info")));
    Ok(())
}

/// Advisor that only addresses the replica count of one unit.
struct ReplicasOnly(UnitId);

#[async_trait]
impl Advisor for ReplicasOnly {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(format!(
            "{{\"summary\": \"api was scaled by hand\", \"corrections\": \
             [{{\"unit_id\": \"{}\", \"patch\": {{\"spec.replicas\": 3}}, \
             \"explanation\": \"scale back to 3\"}}]}}",
            self.0
        ))
    }
}

#[tokio::test]
async fn given_advice_covering_one_field_when_cycle_runs_then_mechanical_plan_fills_the_rest() -> TestResult {
    // Given: replicas and image both drifted, advice only for replicas
    let world = World::new(&["base"]);
    let api = world
        .unit(
            "base",
            deployment("api", 3),
            &[
                (paths::replicas(), json!(5)),
                (paths::image(), json!("shop/api:1.5")),
            ],
        )
        .await;
    let ctx = world.context("base", world.registry.clone());
    let reconciler = ReconcilerBuilder::new()
        .with_advisor(Arc::new(ReplicasOnly(api)), std::time::Duration::from_secs(5))
        .build()?;

    // When: a dry-run cycle runs
    let report = reconciler.run_cycle(&ctx, &WorkKey::Sweep, None).await;

    // Then: one advisor plan restores both fields
    assert_eq!(report.analysis, AnalysisSource::Advisor);
    assert_eq!(report.summary, "api was scaled by hand");
    assert_eq!(report.plans.len(), 1);
    let plan = &report.plans[0];
    assert_eq!(plan.source, PlanSource::Advisor);
    assert_eq!(plan.patch.get(&paths::replicas()), Some(&json!(3)));
    assert_eq!(plan.patch.get(&paths::image()), Some(&json!("shop/api:1.4")));
    assert_eq!(plan.origin.len(), 2);

    // And: both items are planned
    assert_eq!(report.drift_count(), 2);
    assert!(report.items.iter().all(|item| item.status == ItemStatus::Planned));
    Ok(())
}
