//! Core error types for driftwatch.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.
//! Collaborator failures carry an [`ErrorClass`] so the reconciliation loop can
//! decide between retrying, skipping an identity, or halting.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or timeout failure; retried with backoff, then skipped for the cycle.
    Transient,
    /// The unit or resource disappeared between listing and fetch; skip the identity.
    NotFound,
    /// Concurrent modification; retried once after a re-fetch, then surfaced as a warning.
    Conflict,
    /// Initialization failure; the process halts.
    Fatal,
}

impl ErrorClass {
    /// Whether an operation failing with this class may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Implemented by every collaborator error so retry helpers can inspect it.
pub trait Classify {
    /// Classification of this error.
    fn class(&self) -> ErrorClass;
}

/// Core error type for driftwatch operations.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    // Model errors
    #[error("invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("cannot patch '{path}': {reason}")]
    PatchFailed { path: String, reason: String },

    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    // Scope hierarchy errors
    #[error("scope '{scope}' not found")]
    ScopeNotFound { scope: String },

    #[error("scope '{scope}' already exists")]
    DuplicateScope { scope: String },

    #[error("linking '{scope}' under '{upstream}' would create a cycle")]
    ScopeCycle { scope: String, upstream: String },

    #[error("upstream unit of '{unit}' must live in scope '{expected}', found '{actual}'")]
    UpstreamScopeMismatch {
        unit: String,
        expected: String,
        actual: String,
    },
}

impl Error {
    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a patch failure.
    pub fn patch_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PatchFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid document error.
    pub fn invalid_document(reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Create a scope not found error.
    pub fn scope_not_found(scope: impl Into<String>) -> Self {
        Self::ScopeNotFound {
            scope: scope.into(),
        }
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Self::ScopeNotFound { .. } => ErrorClass::NotFound,
            Self::FileReadFailed { .. }
            | Self::TomlParseFailed { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Fatal,
            Self::InvalidPath { .. }
            | Self::PatchFailed { .. }
            | Self::InvalidDocument { .. }
            | Self::DuplicateScope { .. }
            | Self::ScopeCycle { .. }
            | Self::UpstreamScopeMismatch { .. } => ErrorClass::Conflict,
        }
    }
}

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_path("spec..replicas", "empty segment");
        assert!(err.to_string().contains("spec..replicas"));
        assert!(err.to_string().contains("empty segment"));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::NotFound.is_retryable());
        assert!(!ErrorClass::Conflict.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert_eq!(Error::invalid_config("bad").class(), ErrorClass::Fatal);
    }
}
