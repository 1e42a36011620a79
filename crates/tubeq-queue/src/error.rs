//! Queue error types.

use thiserror::Error;
use tubeq_models::TransitionError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Transition rejected: {0}")]
    Conflict(#[from] TransitionError),

    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    #[error("Job {0} changed concurrently too many times")]
    Contention(String),

    #[error("Corrupt record for job {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn not_found(id: impl ToString) -> Self {
        Self::JobNotFound(id.to_string())
    }

    pub fn lease_lost(id: impl ToString) -> Self {
        Self::LeaseLost(id.to_string())
    }

    /// Store unreachable or misbehaving, as opposed to a rejected request.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionFailed(_)
                | QueueError::Redis(_)
                | QueueError::Json(_)
                | QueueError::Corrupt(_)
                | QueueError::Contention(_)
        )
    }
}
