//! Common error types for Frameflow
//!
//! This module defines all error types used across the Frameflow worker.
//! Errors carry a transient/permanent classification so the consumption loop can
//! decide between backing off and giving up.

use thiserror::Error;

/// Main error type for Frameflow
#[derive(Error, Debug)]
pub enum FrameflowError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lost or refused connection to the stream store
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream store rejected a command
    #[error("Stream store error: {0}")]
    Store(String),

    /// Registration with the orchestrator failed
    #[error("Registration error: {0}")]
    Registration(String),

    /// Inference function failed on an input
    #[error("Inference error: {0}")]
    Inference(String),

    /// Entry lacks data required for processing
    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for FrameflowError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            FrameflowError::Connection(err.to_string())
        } else {
            FrameflowError::Store(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for FrameflowError {
    fn from(err: serde_yaml::Error) -> Self {
        FrameflowError::Config(err.to_string())
    }
}

impl From<frameflow_proto::WireError> for FrameflowError {
    fn from(err: frameflow_proto::WireError) -> Self {
        match err {
            frameflow_proto::WireError::MissingField { .. } => {
                FrameflowError::MalformedEntry(err.to_string())
            }
            _ => FrameflowError::Store(err.to_string()),
        }
    }
}

impl FrameflowError {
    /// True for failures that may succeed when retried after a short pause
    pub fn is_transient(&self) -> bool {
        matches!(self, FrameflowError::Connection(_) | FrameflowError::Timeout(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        FrameflowError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        FrameflowError::Connection(msg.into())
    }

    /// Create a stream store error
    pub fn store(msg: impl Into<String>) -> Self {
        FrameflowError::Store(msg.into())
    }

    /// Create a registration error
    pub fn registration(msg: impl Into<String>) -> Self {
        FrameflowError::Registration(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        FrameflowError::Inference(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        FrameflowError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        FrameflowError::Internal(msg.into())
    }
}

/// Result type alias for Frameflow operations
pub type Result<T> = std::result::Result<T, FrameflowError>;
