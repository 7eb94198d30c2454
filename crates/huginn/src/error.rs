//! Error types for the tracing runtime.

use thiserror::Error;

/// Result type alias for tracing operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors that can occur in the tracing runtime.
///
/// Delivery failures (`Sink`) never reach application code through the
/// span lifecycle paths; they surface only as a `false` return from
/// [`crate::TraceClient::flush`]. The contract-violation variants
/// (`ContextViolation`, `TerminalSpan`) indicate programming errors in the
/// host application, not runtime faults.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The sink rejected a batch or was unreachable.
    #[error("Sink error: {0}")]
    Sink(String),

    /// The execution-context stack was popped out of LIFO order or while empty.
    #[error("Context violation: {0}")]
    ContextViolation(String),

    /// A lifecycle operation was attempted on an already-finished span.
    #[error("Terminal span: {0}")]
    TerminalSpan(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TraceError::Sink("connection refused".to_string());
        assert_eq!(err.to_string(), "Sink error: connection refused");

        let err = TraceError::ContextViolation("pop on empty stack".to_string());
        assert!(err.to_string().contains("pop on empty stack"));
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TraceError = json_err.into();
        assert!(matches!(err, TraceError::Serialization(_)));
    }
}
