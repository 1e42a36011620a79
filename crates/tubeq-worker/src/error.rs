//! Worker error types.

use thiserror::Error;
use tubeq_media::FetchError;
use tubeq_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Capacity reached: {active} active jobs (limit {limit})")]
    Capacity { active: usize, limit: usize },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Fetch failed: {0}")]
    TerminalFetch(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Reservation lost: {0}")]
    Stall(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Worth another attempt of the same job.
    ///
    /// A store outage during an attempt is retried like an upstream blip.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::TransientFetch(_) | WorkerError::Persistence(_)
        )
    }

    /// Label for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            WorkerError::TransientFetch(_) => "transient",
            WorkerError::Conversion(_) => "conversion",
            WorkerError::Stall(_) => "stalled",
            WorkerError::Persistence(_) => "persistence",
            WorkerError::Io(_) => "io",
            _ => "terminal",
        }
    }
}

impl From<QueueError> for WorkerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::JobNotFound(id) => Self::NotFound(id),
            QueueError::Conflict(e) => Self::Conflict(e.to_string()),
            QueueError::LeaseLost(id) => Self::Stall(format!("lease lost for job {}", id)),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<FetchError> for WorkerError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            FetchError::Conversion(_) => Self::Conversion(err.to_string()),
            e if e.is_retryable() => Self::TransientFetch(e.to_string()),
            e => Self::TerminalFetch(e.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for WorkerError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}
