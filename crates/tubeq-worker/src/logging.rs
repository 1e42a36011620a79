//! Structured job logging utilities.
//!
//! Every line carries `job_id`, `worker` and `attempt` so one attempt of a
//! job can be followed across the executor, heartbeat and progress tasks.

use std::path::Path;

use tracing::Span;
use tubeq_models::{DownloadJob, JobId};

/// Log at `$level` with the attempt's identifying fields attached.
macro_rules! attempt_event {
    ($level:ident, $logger:expr, $($arg:tt)+) => {
        tracing::$level!(
            job_id = %$logger.job_id,
            worker = %$logger.worker,
            attempt = $logger.attempt,
            $($arg)+
        )
    };
}

/// Identity of one attempt of one job, for logs and spans.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    worker: String,
    attempt: u32,
}

impl JobLogger {
    /// `attempt` is 1-based.
    pub fn new(job_id: &JobId, worker: &str, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            worker: worker.to_string(),
            attempt,
        }
    }

    /// Logger for the attempt about to run on `job`.
    pub fn for_job(job: &DownloadJob, worker: &str) -> Self {
        Self::new(&job.id, worker, job.retry_count + 1)
    }

    pub fn started(&self, source_url: &str) {
        attempt_event!(info, self, source_url, "Attempt started");
    }

    pub fn info(&self, message: &str) {
        attempt_event!(info, self, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        attempt_event!(warn, self, "{}", message);
    }

    pub fn error(&self, message: &str) {
        attempt_event!(error, self, "{}", message);
    }

    pub fn completed(&self, output: &Path, bytes: usize) {
        attempt_event!(
            info,
            self,
            output = %output.display(),
            bytes,
            "Attempt completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span wrapping every task spawned for this attempt.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "attempt",
            job_id = %self.job_id,
            worker = %self.worker,
            attempt = self.attempt
        )
    }
}
