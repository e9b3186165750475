//! Error types for rillserve

use thiserror::Error;

/// Main error type for serving operations.
///
/// Variants correspond to the surfaces a caller can observe: validation
/// failures short-circuit before enqueue, admission failures short-circuit
/// at the server/scheduler boundary, and inference failures propagate to
/// every request in the offending batch.
#[derive(Debug, Error, Clone)]
pub enum ServeError {
    /// Request failed validation (missing field, bad enum, out of range)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Caller exceeded its token bucket
    #[error("Rate limit exceeded for client {client}")]
    RateLimited { client: String },

    /// No model registered under the requested name
    #[error("Unknown model: {name}")]
    UnknownModel { name: String },

    /// The priority queue for the model is at capacity
    #[error("Queue full for model {model}")]
    QueueFull { model: String },

    /// Connection cap reached
    #[error("Server overloaded: {message}")]
    Overloaded { message: String },

    /// Server is draining and rejects new work
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Model loader failed
    #[error("Model load failed: {message}")]
    LoadError { message: String },

    /// Warm-up generation failed after a successful load
    #[error("Model warm-up failed: {message}")]
    WarmupError { message: String },

    /// A model with this (name, version) is already published
    #[error("Model {name} v{version} is already loaded")]
    AlreadyLoaded { name: String, version: String },

    /// The model raised during generation
    #[error("Inference error: {message}")]
    Inference { message: String },

    /// An operation exceeded its wall-time budget
    #[error("Operation timed out: {message}")]
    Timeout { message: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ServeError>;

impl ServeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn rate_limited(client: impl Into<String>) -> Self {
        Self::RateLimited {
            client: client.into(),
        }
    }

    pub fn unknown_model(name: impl Into<String>) -> Self {
        Self::UnknownModel { name: name.into() }
    }

    pub fn queue_full(model: impl Into<String>) -> Self {
        Self::QueueFull {
            model: model.into(),
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded {
            message: message.into(),
        }
    }

    pub fn load_error(message: impl Into<String>) -> Self {
        Self::LoadError {
            message: message.into(),
        }
    }

    pub fn warmup_error(message: impl Into<String>) -> Self {
        Self::WarmupError {
            message: message.into(),
        }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Client-caused errors (4xx equivalent); not counted as error metrics.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::RateLimited { .. }
                | Self::UnknownModel { .. }
                | Self::QueueFull { .. }
                | Self::Overloaded { .. }
                | Self::ShuttingDown
        )
    }

    /// Server-side failures (5xx equivalent)
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::LoadError { .. }
                | Self::WarmupError { .. }
                | Self::Inference { .. }
                | Self::Timeout { .. }
                | Self::Serialization { .. }
                | Self::Io { .. }
                | Self::Internal { .. }
        )
    }

    /// Whether the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::Overloaded { .. } | Self::RateLimited { .. }
        )
    }
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ServeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
