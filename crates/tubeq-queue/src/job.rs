//! Durable job payload.
//!
//! The payload is the minimal request record stored next to the job
//! snapshot. It never changes after insertion except for the retry count, so
//! a job can be rebuilt from it when the snapshot is unreadable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tubeq_models::{AudioFormat, AudioQuality, DownloadJob, JobId, Priority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: JobId,
    pub url: String,
    pub client_channel: String,
    #[serde(default)]
    pub quality: AudioQuality,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl JobPayload {
    pub fn from_job(job: &DownloadJob) -> Self {
        Self {
            id: job.id.clone(),
            url: job.source_url.clone(),
            client_channel: job.client_channel.clone(),
            quality: job.quality,
            format: job.format,
            priority: job.priority,
            retry_count: job.retry_count,
            created_at: job.created_at,
        }
    }

    /// Rebuild a queued job, eligible immediately.
    pub fn rebuild(&self) -> DownloadJob {
        let mut job = DownloadJob::new(
            self.url.clone(),
            self.client_channel.clone(),
            self.priority,
            self.quality,
            self.format,
        );
        job.id = self.id.clone();
        job.created_at = self.created_at;
        job.retry_count = self.retry_count;
        job
    }
}
