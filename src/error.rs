//! Error types for corelay.
//!
//! All errors are strongly typed using thiserror. Note that correlation
//! failures are deliberately *not* errors: a missing source, an unmatched
//! request, or an elapsed deadline all degrade to a payload with fewer
//! fields. The types here cover configuration problems and host-capability
//! failures only.

use thiserror::Error;

/// Validation errors raised while checking rule configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Rule id cannot be empty")]
    EmptyRuleId,

    #[error("Field name cannot be empty in rule '{rule_id}'")]
    EmptyFieldName {
        rule_id: String,
    },

    #[error("Rule '{rule_id}' declares no field mappings")]
    NoMappings {
        rule_id: String,
    },

    #[error("Invalid URL pattern '{pattern}': {reason}")]
    InvalidUrlPattern {
        pattern: String,
        reason: String,
    },
}

/// Execution errors raised by the observer's host-facing machinery.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Interceptor install failed: {message}")]
    InstallFailed {
        message: String,
    },

    #[error("Interceptor uninstall failed: {message}")]
    UninstallFailed {
        message: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Top-level error type for corelay.
///
/// This enum encompasses all possible errors that can occur
/// when configuring or installing the engine.
#[derive(Debug, Error)]
pub enum CorelayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CorelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for corelay operations.
pub type CorelayResult<T> = Result<T, CorelayError>;
