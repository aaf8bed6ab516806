//! Error types for the chat system.

use std::path::PathBuf;

use howtolive_core::CoreError;
use thiserror::Error;

/// Result type for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Result type for session store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Session store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Handler state error: {0}")]
    State(#[from] CoreError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}

/// Chat system errors
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM not configured. Set the key named by llm.api_key_env (default HOWTOLIVE_API_KEY)")]
    LlmNotConfigured,

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ChatError> for CoreError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Core(e) => e,
            other => CoreError::ResourceUnavailable(other.to_string()),
        }
    }
}
