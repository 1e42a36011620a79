//! Progress event schema pushed to subscribers.
//!
//! Field names are camelCase on the wire to match the realtime transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{DownloadJob, JobId, JobStatus};

/// Stage of the pipeline an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queued,
    FetchingMetadata,
    Downloading,
    Converting,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Queued => "queued",
            ProgressPhase::FetchingMetadata => "fetching_metadata",
            ProgressPhase::Downloading => "downloading",
            ProgressPhase::Converting => "converting",
            ProgressPhase::Paused => "paused",
            ProgressPhase::Retrying => "retrying",
            ProgressPhase::Completed => "completed",
            ProgressPhase::Failed => "failed",
            ProgressPhase::Cancelled => "cancelled",
        }
    }

    /// Default phase reported for a status change.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => ProgressPhase::Queued,
            JobStatus::Downloading => ProgressPhase::Downloading,
            JobStatus::Paused => ProgressPhase::Paused,
            JobStatus::Completed => ProgressPhase::Completed,
            JobStatus::Failed => ProgressPhase::Failed,
            JobStatus::Cancelled => ProgressPhase::Cancelled,
        }
    }
}

/// One progress or status change of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub progress: u8,
    pub phase: ProgressPhase,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Event describing the given snapshot.
    pub fn for_job(job: &DownloadJob, phase: ProgressPhase) -> Self {
        Self {
            job_id: job.id.clone(),
            progress: job.progress,
            phase,
            status: job.status,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
