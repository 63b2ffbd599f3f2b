//! Per-cycle reports and where they go.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftwatch_core::{
    CorrectionPlan, DriftRecord, FieldPath, FieldValue, ResourceIdentity, ScopeId, Severity, UnitId,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::analyzer::AnalysisSource;
use crate::propagation::PropagationReport;
use crate::queue::WorkKey;

/// Fate of one drift item within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Detected,
    /// A correction exists but auto-correct is off.
    Planned,
    Corrected,
    Failed { reason: String },
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detected => f.write_str("detected"),
            Self::Planned => f.write_str("planned"),
            Self::Corrected => f.write_str("corrected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportItem {
    pub unit: UnitId,
    pub scope: ScopeId,
    pub resource: ResourceIdentity,
    pub field: FieldPath,
    pub expected: FieldValue,
    pub actual: FieldValue,
    pub severity: Severity,
    pub status: ItemStatus,
}

impl ReportItem {
    pub fn detected(record: &DriftRecord) -> Self {
        Self {
            unit: record.unit,
            scope: record.scope.clone(),
            resource: record.resource.clone(),
            field: record.path.clone(),
            expected: record.expected.clone(),
            actual: record.actual.clone(),
            severity: record.severity,
            status: ItemStatus::Detected,
        }
    }

    /// Whether `plan` was generated from this item.
    pub fn is_covered_by(&self, plan: &CorrectionPlan) -> bool {
        plan.unit == self.unit && plan.origin.iter().any(|record| record.path == self.field)
    }
}

/// A unit or resource that could not be processed this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub target: String,
    pub reason: String,
}

/// Result of one reconciliation cycle, produced even when it partially fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target: WorkKey,
    pub units_checked: usize,
    pub summary: String,
    pub analysis: AnalysisSource,
    /// Drift items detected this cycle.
    pub drift_count: usize,
    pub items: Vec<ReportItem>,
    pub plans: Vec<CorrectionPlan>,
    pub corrections_applied: usize,
    pub propagations: Vec<PropagationReport>,
    pub failures: Vec<CycleFailure>,
    /// Identities skipped without failing the cycle.
    pub skipped: Vec<String>,
}

impl CycleReport {
    pub fn new(target: WorkKey) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            target,
            units_checked: 0,
            summary: String::new(),
            analysis: AnalysisSource::Fallback,
            drift_count: 0,
            items: Vec::new(),
            plans: Vec::new(),
            corrections_applied: 0,
            propagations: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn fail(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(CycleFailure {
            target: target.into(),
            reason: reason.into(),
        });
    }

    pub const fn drift_count(&self) -> usize {
        self.drift_count
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
            || self
                .items
                .iter()
                .any(|item| matches!(item.status, ItemStatus::Failed { .. }))
    }

    /// Human-readable rendering for terminals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Reconciliation of {} at {}", self.target, self.finished_at);
        let _ = writeln!(out, "  {}", self.summary);
        for item in &self.items {
            let _ = writeln!(
                out,
                "  [{}] {} {}: expected {}, actual {} ({})",
                item.severity, item.resource, item.field, item.expected, item.actual, item.status
            );
        }
        for plan in &self.plans {
            let _ = writeln!(out, "  plan for {}: {}", plan.resource, plan.explanation);
        }
        if self.corrections_applied > 0 {
            let _ = writeln!(out, "  corrections applied: {}", self.corrections_applied);
        }
        for note in self.propagations.iter().flat_map(|p| &p.notes) {
            let _ = writeln!(out, "  note: {note}");
        }
        for failure in &self.failures {
            let _ = writeln!(out, "  FAILED {}: {}", failure.target, failure.reason);
        }
        out
    }
}

/// Destination for cycle reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &CycleReport);
}

/// Sink that logs each report.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn publish(&self, report: &CycleReport) {
        if report.has_failures() {
            warn!(
                target_key = %report.target,
                drift = report.drift_count(),
                failures = report.failures.len(),
                summary = %report.summary,
                "Cycle finished with failures"
            );
        } else {
            info!(
                target_key = %report.target,
                drift = report.drift_count(),
                corrections = report.corrections_applied,
                summary = %report.summary,
                "Cycle finished"
            );
        }
    }
}

/// Sink forwarding reports over a channel.
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    tx: mpsc::UnboundedSender<CycleReport>,
}

impl ChannelReportSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CycleReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReportSink for ChannelReportSink {
    async fn publish(&self, report: &CycleReport) {
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(report.clone());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_failed_items_count_as_failures() {
        let mut report = CycleReport::new(WorkKey::Sweep);
        assert!(!report.has_failures());
        report.items.push(ReportItem {
            unit: UnitId::new(),
            scope: ScopeId::from("base"),
            resource: ResourceIdentity::new("Deployment", "shop", "api"),
            field: FieldPath::parse("spec.replicas").unwrap(),
            expected: FieldValue::Integer(3),
            actual: FieldValue::Integer(5),
            severity: Severity::Warning,
            status: ItemStatus::Failed {
                reason: "registry unavailable".to_string(),
            },
        });
        assert!(report.has_failures());
        assert!(report.render_text().contains("failed: registry unavailable"));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelReportSink::new();
        sink.publish(&CycleReport::new(WorkKey::Sweep)).await;
        assert_eq!(rx.recv().await.unwrap().target, WorkKey::Sweep);
    }
}
