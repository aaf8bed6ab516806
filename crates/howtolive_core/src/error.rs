//! Error types for the core module.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in handlers, classifiers and resource tiers.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Handler failed: {handler} - {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Invalid handler state for {handler}: {message}")]
    InvalidState { handler: String, message: String },

    #[error("Close failed: {0}")]
    Close(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a handler failure error.
    pub fn handler_failed(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::handler_failed("howtocook", "model timed out");
        assert_eq!(err.to_string(), "Handler failed: howtocook - model timed out");

        let err = CoreError::ResourceUnavailable("tools".to_string());
        assert_eq!(err.to_string(), "Resource unavailable: tools");
    }
}
