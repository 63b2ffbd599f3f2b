//! Error types for the reconciler crate.

use std::fmt;
use std::time::Duration;

use driftwatch_core::{Classify, ErrorClass};

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Registry transport failure.
    RegistryUnavailable { operation: String, reason: String },
    /// Unit does not exist in the registry.
    UnitNotFound { unit: String },
    /// Registry Set does not exist.
    SetNotFound { name: String },
    /// Unit changed since it was read.
    VersionConflict {
        unit: String,
        expected: u64,
        actual: u64,
    },
    /// Unit rejected by the registry.
    InvalidUnit { reason: String },
    /// Cluster collaborator failure.
    Cluster(driftwatch_events::Error),
    /// Core model failure (paths, patches, scopes).
    Model { class: ErrorClass, reason: String },
    /// Advisory collaborator failure.
    Advisor { reason: String },
    /// Collaborator call exceeded its bound.
    Timeout { operation: String, timeout_ms: u64 },
    /// Record cannot be corrected by patching desired state.
    NotCorrectable { reason: String },
    /// Shutdown interrupted the operation.
    Cancelled,
    /// Loop was stopped by a fatal error.
    LoopStopped { reason: String },
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryUnavailable { operation, reason } => {
                write!(f, "registry unavailable during '{operation}': {reason}")
            }
            Self::UnitNotFound { unit } => {
                write!(f, "unit '{unit}' not found")
            }
            Self::SetNotFound { name } => {
                write!(f, "set '{name}' not found")
            }
            Self::VersionConflict {
                unit,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "unit '{unit}' changed concurrently (expected version {expected}, found {actual})"
                )
            }
            Self::InvalidUnit { reason } => {
                write!(f, "invalid unit: {reason}")
            }
            Self::Cluster(err) => {
                write!(f, "cluster error: {err}")
            }
            Self::Model { reason, .. } => {
                write!(f, "model error: {reason}")
            }
            Self::Advisor { reason } => {
                write!(f, "advisor error: {reason}")
            }
            Self::Timeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "'{operation}' timed out after {timeout_ms}ms")
            }
            Self::NotCorrectable { reason } => {
                write!(f, "not correctable: {reason}")
            }
            Self::Cancelled => {
                write!(f, "cancelled by shutdown")
            }
            Self::LoopStopped { reason } => {
                write!(f, "reconciliation loop stopped: {reason}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a registry unavailable error.
    pub fn registry_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistryUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a unit not found error.
    pub fn unit_not_found(unit: impl ToString) -> Self {
        Self::UnitNotFound {
            unit: unit.to_string(),
        }
    }

    /// Create a version conflict error.
    pub fn version_conflict(unit: impl ToString, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            unit: unit.to_string(),
            expected,
            actual,
        }
    }

    /// Create an invalid unit error.
    pub fn invalid_unit(reason: impl Into<String>) -> Self {
        Self::InvalidUnit {
            reason: reason.into(),
        }
    }

    /// Create an advisor error.
    pub fn advisor(reason: impl Into<String>) -> Self {
        Self::Advisor {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a not correctable error.
    pub fn not_correctable(reason: impl Into<String>) -> Self {
        Self::NotCorrectable {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Self::RegistryUnavailable { .. } | Self::Advisor { .. } | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::UnitNotFound { .. } | Self::SetNotFound { .. } => ErrorClass::NotFound,
            Self::VersionConflict { .. } | Self::InvalidUnit { .. } | Self::NotCorrectable { .. } => {
                ErrorClass::Conflict
            }
            Self::Cluster(err) => err.class(),
            Self::Model { class, .. } => *class,
            Self::Cancelled | Self::LoopStopped { .. } | Self::InvalidConfig { .. } => {
                ErrorClass::Fatal
            }
        }
    }
}

impl From<driftwatch_events::Error> for Error {
    fn from(err: driftwatch_events::Error) -> Self {
        Self::Cluster(err)
    }
}

impl From<driftwatch_core::Error> for Error {
    fn from(err: driftwatch_core::Error) -> Self {
        Self::Model {
            class: err.class(),
            reason: err.to_string(),
        }
    }
}
