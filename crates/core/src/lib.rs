//! Core types for drift detection and reconciliation.
//!
//! - **Documents**: Kubernetes-shaped configuration and its typed schema projection
//! - **Paths and patches**: dotted field paths and structural, idempotent patches
//! - **Model**: desired units, observed resources, drift records, correction plans
//! - **Scopes**: the upstream/downstream environment hierarchy
//! - **Config**: layered configuration loading

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod document;
pub mod error;
pub mod model;
pub mod patch;
pub mod path;
pub mod scope;
pub mod shutdown;
pub mod types;

pub use config::{Config, load_config};
pub use document::{ConfigDocument, FieldType, FieldValue, ResourceSchema};
pub use error::{Classify, Error, ErrorClass, Result};
pub use model::{
    CorrectionPlan, DesiredUnit, DriftRecord, Labels, MonitoredScope, ObservedResource,
    PlanSource, ResourceStatus, Severity, UnitFilter, UnitSet,
};
pub use patch::{Patch, deep_merge};
pub use path::{FieldPath, Segment};
pub use scope::ScopeTree;
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use types::{ResourceFamily, ResourceIdentity, ResourceKind, ScopeId, UnitId};
