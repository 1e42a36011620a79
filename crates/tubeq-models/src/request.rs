//! Producer-facing request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::job::{AudioFormat, AudioQuality, DownloadJob, JobId, JobStatus, MediaMetadata, Priority};

/// Request to fetch and convert one remote media resource.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DownloadRequest {
    #[validate(url(message = "url must be a valid URL"), length(max = 2048))]
    pub url: String,
    /// Channel progress events for this job are delivered to
    #[validate(length(min = 1, max = 256, message = "client channel is required"))]
    pub client_channel: String,
    #[serde(default)]
    pub quality: AudioQuality,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default)]
    pub priority: Priority,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, client_channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_channel: client_channel.into(),
            quality: AudioQuality::default(),
            format: AudioFormat::default(),
            priority: Priority::default(),
        }
    }

    pub fn with_quality(mut self, quality: AudioQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the queued job for this request.
    pub fn into_job(self) -> DownloadJob {
        DownloadJob::new(
            self.url,
            self.client_channel,
            self.priority,
            self.quality,
            self.format,
        )
    }
}

/// Point-in-time view of a job returned to producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

impl From<&DownloadJob> for JobStatusView {
    fn from(job: &DownloadJob) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            metadata: job.metadata.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
            retry_count: job.retry_count,
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Add one job with the given status.
    pub fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.waiting += 1,
            JobStatus::Downloading => self.active += 1,
            JobStatus::Paused => self.paused += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Counter for one status.
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.waiting,
            JobStatus::Downloading => self.active,
            JobStatus::Paused => self.paused,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let ok = DownloadRequest::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "socket-1");
        assert!(ok.validate().is_ok());

        let bad_url = DownloadRequest::new("not a url", "socket-1");
        assert!(bad_url.validate().is_err());

        let no_channel = DownloadRequest::new("https://youtu.be/dQw4w9WgXcQ", "");
        assert!(no_channel.validate().is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: DownloadRequest = serde_json::from_str(
            r#"{"url":"https://youtu.be/dQw4w9WgXcQ","client_channel":"s1"}"#,
        )
        .unwrap();
        assert_eq!(request.quality, AudioQuality::Highest);
        assert_eq!(request.format, AudioFormat::Mp3);
        assert_eq!(request.priority, Priority::Normal);

        let bad: Result<DownloadRequest, _> = serde_json::from_str(
            r#"{"url":"https://youtu.be/x","client_channel":"s1","priority":7}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_into_job() {
        let job = DownloadRequest::new("https://youtu.be/dQw4w9WgXcQ", "s1")
            .with_quality(AudioQuality::Highest)
            .with_priority(Priority::High)
            .into_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.client_channel, "s1");
    }

    #[test]
    fn test_stats_count() {
        let mut stats = QueueStats::default();
        stats.count(JobStatus::Queued);
        stats.count(JobStatus::Queued);
        stats.count(JobStatus::Failed);
        assert_eq!(stats.get(JobStatus::Queued), 2);
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }
}
