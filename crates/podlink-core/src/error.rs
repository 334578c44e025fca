// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while validating data at the controller boundary
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// A watch event could not be interpreted
    #[error("Invalid watch event: {reason}")]
    #[diagnostic(
        code(podlink::invalid_event),
        help("Watch events must look like {{\"type\": \"ADDED\", \"object\": {{\"kind\": \"Pod\", ...}}}}")
    )]
    InvalidEvent {
        #[allow(unused)]
        reason: String,
    },

    /// A required field was absent
    #[error("Missing required field '{field}' on {kind}")]
    #[diagnostic(
        code(podlink::missing_field),
        help("The orchestrator always sets this field; the event was likely truncated or hand-written")
    )]
    MissingField {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        field: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(podlink::serialization_error),
        help("Ensure the payload is valid JSON")
    )]
    Serialization {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an InvalidEvent error
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            kind: kind.into(),
            field: field.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::missing_field("Pod", "metadata.uid");
        assert!(matches!(err, CoreError::MissingField { .. }));
        assert_eq!(
            err.to_string(),
            "Missing required field 'metadata.uid' on Pod"
        );

        let err = CoreError::invalid_event("object is not a map");
        assert!(matches!(err, CoreError::InvalidEvent { .. }));
    }
}
