//! Drift detection and reconciliation engine.
//!
//! Desired units held in a registry are compared against live resources
//! reported by a cluster. Divergences become drift records, drift records
//! become correction plans, and plans are pushed through the scope hierarchy
//! (base, then every downstream scope) by the propagation engine.
//!
//! # Pipeline
//!
//! 1. [`DesiredStateProvider`] resolves the monitored units of a scope
//! 2. [`ReconcileContext::observe`] fetches each unit's live resource
//! 3. [`DriftComparator`] emits one [`DriftRecord`] per diverging field
//! 4. [`DriftAnalyzer`] summarizes and plans, with or without an advisor
//! 5. [`PropagationEngine`] applies plans when auto-correct is enabled
//!
//! [`ReconciliationLoop`] drives this from observer events and a fallback
//! timer, with at most one pass in flight per resource identity.
//!
//! [`DriftRecord`]: driftwatch_core::DriftRecord
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use driftwatch_core::{MonitoredScope, ScopeId, ScopeTree, ShutdownCoordinator};
//! use driftwatch_events::InMemoryCluster;
//! use driftwatch_reconciler::{
//!     CallBounds, InMemoryRegistry, LogReportSink, LoopConfig, ReconcileContext,
//!     ReconcilerBuilder, ReconciliationLoop,
//! };
//!
//! let cluster = Arc::new(InMemoryCluster::new());
//! let registry = Arc::new(InMemoryRegistry::new(ScopeTree::chain(["base", "prod"])?));
//! let ctx = ReconcileContext::new(
//!     MonitoredScope::new(ScopeId::from("prod"), "default"),
//!     registry,
//!     cluster,
//!     Arc::new(ShutdownCoordinator::new()),
//!     CallBounds::default(),
//! );
//! let reconciler = Arc::new(ReconcilerBuilder::new().auto_correct(true).build()?);
//! let reconciliation =
//!     ReconciliationLoop::new(reconciler, ctx, LoopConfig::default(), Arc::new(LogReportSink));
//! let report = reconciliation.run_once().await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod analyzer;
pub mod comparator;
pub mod context;
pub mod correction;
pub mod error;
pub mod r#loop;
pub mod propagation;
pub mod provider;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod report;

// Re-export main types
pub use analyzer::{Advisor, Analysis, AnalysisSource, DriftAnalyzer, HttpAdvisor, fallback_summary};
pub use comparator::{DriftComparator, compare};
pub use context::{BoundedRegistry, CallBounds, ReconcileContext, bounded};
pub use correction::CorrectionGenerator;
pub use error::{Error, Result};
pub use r#loop::{LoopConfig, LoopStopper, ReconciliationLoop};
pub use propagation::{
    PropagationEngine, PropagationReport, PropagationState, ScopeOutcome, ScopeResult,
};
pub use provider::{DesiredStateProvider, RegistryDesiredStateProvider};
pub use queue::{EnqueueOutcome, WorkKey, WorkQueue};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use registry::{InMemoryRegistry, Registry};
pub use report::{
    ChannelReportSink, CycleFailure, CycleReport, ItemStatus, LogReportSink, ReportItem, ReportSink,
};
