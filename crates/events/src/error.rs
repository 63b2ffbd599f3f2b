//! Error types for the events crate.

use driftwatch_core::{Classify, ErrorClass};
use thiserror::Error;

/// Result type alias for cluster and observer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster API error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network failure or timeout talking to the cluster.
    #[error("cluster unavailable during '{operation}': {reason}")]
    Unavailable { operation: String, reason: String },

    /// Resource does not exist.
    #[error("resource '{resource}' not found")]
    NotFound { resource: String },

    /// Watch stream ended or lagged; re-subscribe.
    #[error("watch on '{kind}' interrupted: {reason}")]
    WatchInterrupted { kind: String, reason: String },

    /// Credentials rejected or API unreachable at startup.
    #[error("cluster access denied: {reason}")]
    AccessDenied { reason: String },

    /// Apply rejected because the live revision moved.
    #[error("resource '{resource}' changed concurrently")]
    Conflict { resource: String },

    /// Operation exceeded its time bound.
    #[error("cluster operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Observer output channel closed.
    #[error("observer channel closed")]
    ChannelClosed,
}

impl Error {
    /// Create an unavailable error.
    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
        }
    }

    /// Create a watch interrupted error.
    pub fn watch_interrupted(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WatchInterrupted {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create an access denied error.
    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } | Self::WatchInterrupted { .. } | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::AccessDenied { .. } | Self::ChannelClosed => ErrorClass::Fatal,
        }
    }
}
