//! Error types for the delivery engine.

use postern_queue::QueueError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store query failed
    #[error("Store error: {0}")]
    Store(String),

    /// A referenced row does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: i64 },

    /// Operation not allowed in the row's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] postern_transport::TransportError),

    /// Webhook client error
    #[error("Webhook error: {0}")]
    Webhook(#[from] postern_webhooks::WebhookError),

    /// HTTP error while talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Certificate or signature check failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// Invalid base64
    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider notification rejected
    #[error("Invalid notification: {0}")]
    InvalidNotification(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }
}

impl From<EngineError> for QueueError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Queue(inner) => inner,
            // Bad payloads and vanished rows do not get better on retry.
            EngineError::Serialization(e) => QueueError::SkipRetry(e.to_string()),
            EngineError::NotFound { .. } => QueueError::SkipRetry(err.to_string()),
            other => QueueError::execution(other),
        }
    }
}
