//! Reconciler implementation.

use std::sync::Arc;
use std::time::Duration;

use driftwatch_core::{
    Classify, CorrectionPlan, DesiredUnit, DriftRecord, ErrorClass, FieldPath, ResourceIdentity,
};
use either::Either;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::analyzer::{Advisor, DriftAnalyzer};
use crate::comparator::DriftComparator;
use crate::context::ReconcileContext;
use crate::error::{Error, Result};
use crate::propagation::{PropagationEngine, PropagationReport};
use crate::queue::{WorkKey, WorkQueue};
use crate::report::{CycleReport, ItemStatus, ReportItem};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Apply corrections; otherwise they are only planned.
    pub auto_correct: bool,
    /// Push applied corrections to downstream scopes.
    pub propagate_downstream: bool,
    /// Paths never compared.
    pub ignore_paths: Vec<FieldPath>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            auto_correct: false,
            propagate_downstream: true,
            ignore_paths: Vec::new(),
        }
    }
}

/// Drift reconciler: compare, analyze, and optionally correct.
pub struct Reconciler {
    comparator: DriftComparator,
    analyzer: DriftAnalyzer,
    engine: PropagationEngine,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(analyzer: DriftAnalyzer, config: ReconcilerConfig) -> Self {
        Self {
            comparator: DriftComparator::new(config.ignore_paths.clone()),
            analyzer,
            engine: PropagationEngine::default().propagate_downstream(config.propagate_downstream),
            config,
        }
    }

    /// Run one reconciliation pass for `target`.
    ///
    /// Always produces a report; failures are recorded in it. During a sweep
    /// with a queue, identities already in flight are left to their own pass.
    pub async fn run_cycle(
        &self,
        ctx: &ReconcileContext,
        target: &WorkKey,
        queue: Option<&WorkQueue>,
    ) -> CycleReport {
        let mut report = CycleReport::new(target.clone());
        info!(target_key = %target, scope = %ctx.monitored.scope, "Starting reconciliation");

        let units = match ctx.provider.monitored_units(&ctx.monitored).await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "Cannot resolve monitored units");
                report.fail("registry", e.to_string());
                report.summary = format!("reconciliation skipped: {e}");
                report.finished_at = chrono::Utc::now();
                return report;
            }
        };

        let namespace = ctx.monitored.namespace.as_str();
        let selected: Vec<(DesiredUnit, ResourceIdentity)> = units
            .into_iter()
            .map(|unit| {
                let identity = unit.identity(namespace);
                (unit, identity)
            })
            .filter(|(_, identity)| match target {
                WorkKey::Resource(wanted) => identity == wanted,
                WorkKey::Sweep => true,
            })
            .collect();
        if selected.is_empty() {
            debug!(target_key = %target, "No monitored unit for target");
        }

        // A sweep holds every identity it claims until its plans are resolved.
        let sweep_queue = queue.filter(|_| matches!(target, WorkKey::Sweep));
        let mut claimed: Vec<WorkKey> = Vec::new();
        let mut records = Vec::new();
        for (unit, identity) in &selected {
            if let Some(queue) = sweep_queue {
                let key = WorkKey::Resource(identity.clone());
                if !claimed.contains(&key) {
                    if !queue.try_acquire(identity) {
                        debug!(resource = %identity, "Resource in flight, left to its own pass");
                        report.skipped.push(format!("{identity}: reconciliation in flight"));
                        continue;
                    }
                    claimed.push(key);
                }
            }

            records.extend(self.check_unit(ctx, unit, identity, &mut report).await);
        }
        report.units_checked = selected.len();

        self.resolve(ctx, &records, &mut report).await;

        if let Some(queue) = sweep_queue {
            for key in &claimed {
                queue.complete(key);
            }
        }
        report.finished_at = chrono::Utc::now();
        report
    }

    async fn check_unit(
        &self,
        ctx: &ReconcileContext,
        unit: &DesiredUnit,
        identity: &ResourceIdentity,
        report: &mut CycleReport,
    ) -> Vec<DriftRecord> {
        match ctx.observe(identity).await {
            Ok(observed) => {
                let records = self.comparator.compare(unit, &observed);
                debug!(unit = %unit.id, resource = %identity, drift = records.len(), "Compared");
                records
            }
            Err(e) if e.class() == ErrorClass::NotFound => {
                debug!(unit = %unit.id, resource = %identity, "Live resource not found, skipping");
                report.skipped.push(format!("{identity}: not found"));
                Vec::new()
            }
            Err(e) => {
                warn!(unit = %unit.id, resource = %identity, error = %e, "Cannot observe resource");
                report.fail(identity.to_string(), e.to_string());
                Vec::new()
            }
        }
    }

    /// Analyze, report, and apply when enabled.
    async fn resolve(&self, ctx: &ReconcileContext, records: &[DriftRecord], report: &mut CycleReport) {
        let analysis = self.analyzer.analyze(records, &ctx.shutdown).await;
        report.summary = analysis.summary;
        report.analysis = analysis.source;
        report.items = records.iter().map(ReportItem::detected).collect();
        report.drift_count = report.items.len();

        info!(
            drift = records.len(),
            plans = analysis.plans.len(),
            auto_correct = self.config.auto_correct,
            "Drift analyzed"
        );

        if !self.config.auto_correct {
            for item in &mut report.items {
                if analysis.plans.iter().any(|plan| item.is_covered_by(plan)) {
                    item.status = ItemStatus::Planned;
                }
            }
            report.plans = analysis.plans;
            return;
        }

        let (applied, failed) = self.apply_plans(ctx, analysis.plans.clone()).await;
        for (plan, propagation) in &applied {
            mark(report, plan, &ItemStatus::Corrected);
            report.propagations.push(propagation.clone());
        }
        for (plan, reason) in &failed {
            mark(
                report,
                plan,
                &ItemStatus::Failed {
                    reason: reason.clone(),
                },
            );
            report.fail(plan.resource.to_string(), reason.clone());
        }
        report.corrections_applied = applied.len();
        report.plans = analysis.plans;

        info!(
            corrections_applied = applied.len(),
            corrections_failed = failed.len(),
            "Corrections processed"
        );
    }

    /// Apply plans one by one; a failure never stops the others.
    async fn apply_plans(
        &self,
        ctx: &ReconcileContext,
        plans: Vec<CorrectionPlan>,
    ) -> (
        Vec<(CorrectionPlan, PropagationReport)>,
        Vec<(CorrectionPlan, String)>,
    ) {
        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in plans {
            debug!(unit = %plan.unit, resource = %plan.resource, "Applying correction");
            let propagation = self
                .engine
                .with_retry(ctx.bounds.retry)
                .run(ctx.registry.as_ref(), plan.unit, &plan.patch)
                .await;
            outcomes.push((plan, propagation));
        }

        outcomes
            .into_iter()
            .partition_map(|(plan, propagation)| {
                if propagation.succeeded() {
                    Either::Left((plan, propagation))
                } else {
                    let reason = propagation
                        .notes
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "correction failed".to_string());
                    warn!(unit = %plan.unit, reason = %reason, "Correction failed");
                    Either::Right((plan, reason))
                }
            })
    }

    /// Get the configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

fn mark(report: &mut CycleReport, plan: &CorrectionPlan, status: &ItemStatus) {
    report
        .items
        .iter_mut()
        .filter(|item| item.is_covered_by(plan))
        .for_each(|item| item.status = status.clone());
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    advisor: Option<Arc<dyn Advisor>>,
    advisor_timeout: Duration,
    ignore_paths: Vec<String>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            advisor: None,
            advisor_timeout: Duration::from_secs(60),
            ignore_paths: Vec::new(),
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the advisory collaborator.
    #[must_use]
    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>, timeout: Duration) -> Self {
        self.advisor = Some(advisor);
        self.advisor_timeout = timeout;
        self
    }

    /// Enable/disable auto-correct.
    #[must_use]
    pub const fn auto_correct(mut self, enabled: bool) -> Self {
        self.config.auto_correct = enabled;
        self
    }

    /// Enable/disable downstream propagation of corrections.
    #[must_use]
    pub const fn propagate_downstream(mut self, enabled: bool) -> Self {
        self.config.propagate_downstream = enabled;
        self
    }

    /// Dotted paths excluded from comparison.
    #[must_use]
    pub fn ignore_paths(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ignore_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unparsable ignore path.
    pub fn build(mut self) -> Result<Reconciler> {
        for raw in &self.ignore_paths {
            let path = FieldPath::parse(raw)
                .map_err(|e| Error::invalid_config(format!("ignore path '{raw}': {e}")))?;
            self.config.ignore_paths.push(path);
        }
        let analyzer = DriftAnalyzer::new(self.advisor, self.advisor_timeout);
        Ok(Reconciler::new(analyzer, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
