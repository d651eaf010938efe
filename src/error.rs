//! Error handling for the plugin lifecycle core.
//!
//! This module provides:
//! - Component-level error enums composed into a single [`CoreError`]
//! - Machine-readable [`ErrorCode`]s with stable numeric codes
//! - Severity classification for logging and alerting
//! - Retryability hints for the supervisor's fetch retry policy

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A specialized Result type for lifecycle core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes surfaced to the host and on the diagnostic bus.
///
/// These codes are stable and can be used by hosts for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors (1000-1099)
    MalformedConstraint,
    MalformedManifest,

    // Repository errors (2000-2099)
    NotFound,
    NotAvailable,

    // Resolver errors (3000-3099)
    DependencyTreeTooDeep,
    CircularDependency,
    UnresolvableConflict,
    IncompatibleDependency,

    // Validation errors (4000-4099)
    SyntaxInvalid,
    StructureMissing,
    PolicyViolation,

    // Sandbox errors (5000-5099)
    SandboxLoadFailed,
    EntryPointFailed,
    SandboxTimeout,

    // Registry errors (6000-6099)
    RegistryConflict,
    PluginNotRegistered,
    InvalidStateTransition,

    // Control errors (7000-7099)
    Cancelled,
    DeadlineExceeded,
    NotReady,

    // Internal errors (9000-9099)
    SerializationError,
    InternalError,
}

impl ErrorCode {
    /// Get the stable numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MalformedConstraint => 1000,
            Self::MalformedManifest => 1001,

            Self::NotFound => 2000,
            Self::NotAvailable => 2001,

            Self::DependencyTreeTooDeep => 3000,
            Self::CircularDependency => 3001,
            Self::UnresolvableConflict => 3002,
            Self::IncompatibleDependency => 3003,

            Self::SyntaxInvalid => 4000,
            Self::StructureMissing => 4001,
            Self::PolicyViolation => 4002,

            Self::SandboxLoadFailed => 5000,
            Self::EntryPointFailed => 5001,
            Self::SandboxTimeout => 5002,

            Self::RegistryConflict => 6000,
            Self::PluginNotRegistered => 6001,
            Self::InvalidStateTransition => 6002,

            Self::Cancelled => 7000,
            Self::DeadlineExceeded => 7001,
            Self::NotReady => 7002,

            Self::SerializationError => 9000,
            Self::InternalError => 9099,
        }
    }

    /// Check if the operation that produced this error may be retried.
    ///
    /// Only transient repository unavailability is retried, with bounded
    /// attempts. Control errors (`Cancelled`, `DeadlineExceeded`) are never
    /// retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotAvailable)
    }

    /// Get the error category for grouping on the diagnostic bus.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "input",
            2000..=2099 => "repository",
            3000..=3099 => "resolver",
            4000..=4099 => "validation",
            5000..=5099 => "sandbox",
            6000..=6099 => "registry",
            7000..=7099 => "control",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Request errors (bad input, unsatisfiable constraints)
    Low,
    /// Operational issues (timeouts, transient repository failures)
    Medium,
    /// System errors that indicate a bug or broken invariant
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::MalformedConstraint
            | ErrorCode::MalformedManifest
            | ErrorCode::NotFound
            | ErrorCode::DependencyTreeTooDeep
            | ErrorCode::CircularDependency
            | ErrorCode::UnresolvableConflict
            | ErrorCode::IncompatibleDependency
            | ErrorCode::SyntaxInvalid
            | ErrorCode::StructureMissing
            | ErrorCode::PolicyViolation
            | ErrorCode::PluginNotRegistered => Self::Low,

            ErrorCode::NotAvailable
            | ErrorCode::SandboxLoadFailed
            | ErrorCode::EntryPointFailed
            | ErrorCode::SandboxTimeout
            | ErrorCode::Cancelled
            | ErrorCode::DeadlineExceeded
            | ErrorCode::NotReady
            | ErrorCode::InvalidStateTransition => Self::Medium,

            ErrorCode::RegistryConflict
            | ErrorCode::SerializationError
            | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level error type for the lifecycle core.
///
/// Component modules define their own `thiserror` enums where the failure is
/// local (manifest parsing, sandbox violations); everything that crosses the
/// supervisor boundary is a `CoreError`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed version constraint: {0}")]
    MalformedConstraint(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Version not available: {id}@{version}")]
    NotAvailable { id: String, version: String },

    #[error("Dependency tree exceeds maximum depth {limit} at '{id}'")]
    DependencyTreeTooDeep { id: String, limit: usize },

    #[error("Circular dependency: {path}")]
    CircularDependency { path: String },

    #[error("Unresolvable version conflict for '{id}': {details}")]
    UnresolvableConflict { id: String, details: String },

    #[error("Incompatible dependency: '{id}' resolved to {resolved}, which violates constraint {constraint}")]
    IncompatibleDependency {
        id: String,
        resolved: String,
        constraint: String,
    },

    #[error("Plugin code failed to parse: {0}")]
    SyntaxInvalid(String),

    #[error("Plugin '{id}' is missing required entry point '{entry}'")]
    StructureMissing { id: String, entry: String },

    #[error("Security policy violation for plugin '{id}': {details}")]
    PolicyViolation { id: String, details: String },

    #[error("Sandbox failed to load plugin '{id}': {details}")]
    SandboxLoadFailed { id: String, details: String },

    #[error("Entry point '{entry}' of plugin '{id}' failed: {details}")]
    EntryPointFailed {
        id: String,
        entry: String,
        details: String,
    },

    #[error("Sandbox call '{entry}' of plugin '{id}' timed out")]
    SandboxTimeout { id: String, entry: String },

    #[error("Registry conflict: {0}")]
    RegistryConflict(String),

    #[error("Plugin not registered: {0}")]
    PluginNotRegistered(String),

    #[error("Invalid state transition for plugin '{id}': {from} -> {to}")]
    InvalidStateTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("Lifecycle core is not initialized")]
    NotReady,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Get the machine-readable code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedConstraint(_) => ErrorCode::MalformedConstraint,
            Self::MalformedManifest(_) => ErrorCode::MalformedManifest,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NotAvailable { .. } => ErrorCode::NotAvailable,
            Self::DependencyTreeTooDeep { .. } => ErrorCode::DependencyTreeTooDeep,
            Self::CircularDependency { .. } => ErrorCode::CircularDependency,
            Self::UnresolvableConflict { .. } => ErrorCode::UnresolvableConflict,
            Self::IncompatibleDependency { .. } => ErrorCode::IncompatibleDependency,
            Self::SyntaxInvalid(_) => ErrorCode::SyntaxInvalid,
            Self::StructureMissing { .. } => ErrorCode::StructureMissing,
            Self::PolicyViolation { .. } => ErrorCode::PolicyViolation,
            Self::SandboxLoadFailed { .. } => ErrorCode::SandboxLoadFailed,
            Self::EntryPointFailed { .. } => ErrorCode::EntryPointFailed,
            Self::SandboxTimeout { .. } => ErrorCode::SandboxTimeout,
            Self::RegistryConflict(_) => ErrorCode::RegistryConflict,
            Self::PluginNotRegistered(_) => ErrorCode::PluginNotRegistered,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::NotReady => ErrorCode::NotReady,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Get the error severity.
    pub const fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Log this error with severity-appropriate level and structured fields.
    pub fn log(&self) {
        let code = self.code();
        match self.severity() {
            ErrorSeverity::High => {
                tracing::error!(
                    error_code = %code,
                    numeric_code = code.numeric_code(),
                    category = code.category(),
                    "{}", self
                );
            }
            ErrorSeverity::Medium => {
                tracing::warn!(
                    error_code = %code,
                    numeric_code = code.numeric_code(),
                    category = code.category(),
                    "{}", self
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    numeric_code = code.numeric_code(),
                    category = code.category(),
                    "{}", self
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_are_stable() {
        assert_eq!(ErrorCode::MalformedConstraint.numeric_code(), 1000);
        assert_eq!(ErrorCode::CircularDependency.numeric_code(), 3001);
        assert_eq!(ErrorCode::SandboxTimeout.numeric_code(), 5002);
        assert_eq!(ErrorCode::Cancelled.numeric_code(), 7000);
    }

    #[test]
    fn test_only_not_available_is_retryable() {
        assert!(ErrorCode::NotAvailable.is_retryable());
        assert!(!ErrorCode::Cancelled.is_retryable());
        assert!(!ErrorCode::DeadlineExceeded.is_retryable());
        assert!(!ErrorCode::CircularDependency.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::CircularDependency.category(), "resolver");
        assert_eq!(ErrorCode::PolicyViolation.category(), "validation");
        assert_eq!(ErrorCode::RegistryConflict.category(), "registry");
    }

    #[test]
    fn test_error_to_code_mapping() {
        let err = CoreError::CircularDependency {
            path: "x -> y -> x".into(),
        };
        assert_eq!(err.code(), ErrorCode::CircularDependency);
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }
}
