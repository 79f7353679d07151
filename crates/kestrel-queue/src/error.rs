//! Error types for queue operations.

use std::time::Duration;
use thiserror::Error;

/// Error surfaced to `put` callers and configuration consumers
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Timed out pushing message to queue after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Interrupted while waiting to push message to queue")]
    Interrupted,

    #[error("Backend error while pushing message to queue: {message}")]
    Protocol { message: String },

    #[error("Failed to get backend connection: {message}")]
    ConnectionFailed { message: String },

    #[error("Backend refused to store message for queue '{queue_name}'")]
    NotStored { queue_name: String },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and the push may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Interrupted => true,
            Self::Protocol { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::NotStored { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Protocol { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

impl From<TransportError> for QueueError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { duration } => Self::Timeout { duration },
            TransportError::Interrupted => Self::Interrupted,
            TransportError::Protocol { message } => Self::Protocol { message },
            TransportError::Io(e) => Self::ConnectionFailed {
                message: e.to_string(),
            },
            TransportError::Shutdown => Self::ConnectionFailed {
                message: "connection is shut down".to_string(),
            },
        }
    }
}

/// Failures reported by a backend connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// The command did not complete within its deadline. On a blocking read this
    /// usually means the connection is wedged and must be replaced.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Operation interrupted")]
    Interrupted,

    /// The server answered with `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR`, or
    /// with something that could not be parsed.
    #[error("Backend protocol error: {message}")]
    Protocol { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection is shut down")]
    Shutdown,
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message envelope has no identifier")]
    MissingIdentifier,

    #[error("No message type registered for identifier '{identifier}'")]
    UnknownIdentifier { identifier: String },

    #[error("Payload does not match message type '{identifier}': {source}")]
    InvalidPayload {
        identifier: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Parsing {
            message: err.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
