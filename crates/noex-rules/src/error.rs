//! Error types for the Noex rules engine.

use thiserror::Error;

/// Result type alias for rules engine operations.
pub type Result<T> = std::result::Result<T, RuleError>;

/// Error types surfaced by the engine's caller-facing APIs.
///
/// Dispatch-time failures inside a rule are never returned through these
/// variants; they are recorded on the trace and counted in the engine stats.
#[derive(Error, Debug)]
pub enum RuleError {
    /// Malformed rule, group, timer, event, duration, or pattern input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reference to an unknown rule, group, event, or timer
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate identifier on a create-only path
    #[error("Conflict: {0}")]
    Conflict(String),

    /// External lookup service failure
    #[error("Lookup error: service={service}, method={method}: {message}")]
    Lookup {
        service: String,
        method: String,
        message: String,
    },

    /// Unknown lookup service
    #[error("Unknown lookup service: {0}")]
    UnknownService(String),

    /// Persistence adapter failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Rule source failure during hot reload
    #[error("Rule source error: source={source_name}: {message}")]
    RuleSource { source_name: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Engine invariant violated; the engine continues but reports it
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Operation submitted after the engine stopped
    #[error("Engine is shut down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuleError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a lookup error.
    pub fn lookup(
        service: impl Into<String>,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Lookup {
            service: service.into(),
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create an invariant violation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InternalInvariant(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Whether this error is a not-found failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuleError::lookup("crm", "get_customer", "connection refused");
        assert_eq!(
            err.to_string(),
            "Lookup error: service=crm, method=get_customer: connection refused"
        );
    }

    #[test]
    fn test_error_construction() {
        let err = RuleError::validation("missing trigger");
        assert!(err.is_validation());
        assert!(!err.is_not_found());

        let err = RuleError::not_found("rule r1");
        assert!(err.is_not_found());
    }
}
