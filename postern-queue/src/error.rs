//! Error types for queue operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job execution failed; the job is retried while attempts remain
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job failed in a way retrying cannot fix; it goes straight to the dead set
    #[error("Job failed permanently: {0}")]
    SkipRetry(String),

    /// No handler registered for job type
    #[error("No handler registered for job type: {0}")]
    NoHandler(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Queue is full
    #[error("Queue is full")]
    QueueFull,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),
}

impl QueueError {
    /// Wrap any displayable error as a retryable execution failure.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        Self::ExecutionFailed(err.to_string())
    }

    /// Whether the queue should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::SkipRetry(_) | Self::NoHandler(_))
    }
}
