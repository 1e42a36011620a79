//! Error types for media fetch operations.

use thiserror::Error;

/// Result type for media fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors reported by a media fetch service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Attempt timed out after {0} seconds")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported media: {0}")]
    Unsupported(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("{0} not found in PATH")]
    ToolMissing(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl FetchError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Transient upstream signals worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::RateLimited(_) | FetchError::Timeout(_)
        )
    }

    /// Failures raised while transcoding rather than fetching.
    pub fn is_conversion(&self) -> bool {
        matches!(self, FetchError::Conversion(_))
    }

    /// Map tool output of a failed run onto the error taxonomy.
    ///
    /// `context` is prefixed to the message of the resulting error.
    pub fn classify_stderr(context: &str, stderr: &str) -> Self {
        let last_line = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("Unknown error")
            .trim();
        let message = format!("{}: {}", context, last_line);
        let lower = stderr.to_ascii_lowercase();

        let rate_limited = ["429", "too many requests", "rate limit", "sign in to confirm"];
        if rate_limited.iter().any(|p| lower.contains(p)) {
            return FetchError::RateLimited(message);
        }

        let transient = [
            "502",
            "503",
            "bad gateway",
            "service unavailable",
            "connection reset",
            "connection refused",
            "timed out",
            "temporary failure in name resolution",
            "name or service not known",
            "network is unreachable",
            "econnreset",
            "econnrefused",
            "etimedout",
            "eai_again",
            "enotfound",
        ];
        if transient.iter().any(|p| lower.contains(p)) {
            return FetchError::Network(message);
        }

        let missing = [
            "video unavailable",
            "private video",
            "has been removed",
            "does not exist",
            "404",
        ];
        if missing.iter().any(|p| lower.contains(p)) {
            return FetchError::NotFound(message);
        }

        if lower.contains("postprocessing") || lower.contains("ffmpeg") || lower.contains("ffprobe") {
            return FetchError::Conversion(message);
        }

        // Unsupported URLs, live events, missing formats and anything unknown
        FetchError::Unsupported(message)
    }
}
