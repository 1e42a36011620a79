//! Download job entity and its state machine.
//!
//! A [`DownloadJob`] is an immutable snapshot. Every transition borrows the
//! current snapshot and returns a new one, or a [`TransitionError`] when the
//! move is not allowed from the current status. Repositories store snapshots
//! and apply transitions under compare-and-set, so no two writers ever mutate
//! the same job in place.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobAction, TransitionError};

/// Maximum number of failed attempts a job may accumulate.
pub const MAX_RETRIES: u32 = 3;

/// Error recorded on an attempt lost to a silent worker.
pub const STALL_ERROR: &str = "worker stopped reporting progress (stalled)";

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker
    #[default]
    Queued,
    /// Held by a worker, fetch/convert in flight
    Downloading,
    /// Held by a worker, transfer parked at a chunk boundary
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Downloading,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No further transitions are accepted from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that count against admission control.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Downloading)
    }

    /// Statuses in which a worker owns the job.
    pub fn is_reserved(&self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Dequeue priority. Affects ordering only, never preempts a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            other => Err(format!("priority must be between 1 and 3, got {}", other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

/// Requested output quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AudioQuality {
    #[default]
    #[serde(rename = "highest")]
    Highest,
    #[serde(rename = "lowest")]
    Lowest,
    #[serde(rename = "128kbps")]
    Kbps128,
    #[serde(rename = "192kbps")]
    Kbps192,
    #[serde(rename = "320kbps")]
    Kbps320,
}

impl AudioQuality {
    const DEFAULT_BITRATE_KBPS: u32 = 192;

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Highest => "highest",
            AudioQuality::Lowest => "lowest",
            AudioQuality::Kbps128 => "128kbps",
            AudioQuality::Kbps192 => "192kbps",
            AudioQuality::Kbps320 => "320kbps",
        }
    }

    /// Target bitrate for conversion.
    ///
    /// `Highest`/`Lowest` only steer which source stream is picked; they
    /// convert at the default bitrate.
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            AudioQuality::Kbps128 => 128,
            AudioQuality::Kbps192 => 192,
            AudioQuality::Kbps320 => 320,
            AudioQuality::Highest | AudioQuality::Lowest => Self::DEFAULT_BITRATE_KBPS,
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "highest" => Ok(AudioQuality::Highest),
            "lowest" => Ok(AudioQuality::Lowest),
            "128kbps" => Ok(AudioQuality::Kbps128),
            "192kbps" => Ok(AudioQuality::Kbps192),
            "320kbps" => Ok(AudioQuality::Kbps320),
            other => Err(format!(
                "quality must be one of highest, lowest, 128kbps, 192kbps, 320kbps; got {}",
                other
            )),
        }
    }
}

/// Requested output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" => Ok(AudioFormat::Wav),
            "flac" => Ok(AudioFormat::Flac),
            other => Err(format!("format must be one of mp3, wav, flac; got {}", other)),
        }
    }
}

/// Metadata of the remote media, populated during the fetch phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub author: String,
    pub duration_secs: u64,
    pub thumbnail_url: String,
    /// Source audio quality label, e.g. `160kbps`
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Identifier of the media on the upstream platform
    pub source_id: String,
}

/// Snapshot of one download job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub source_url: String,
    /// Opaque subscription target for progress events
    pub client_channel: String,
    pub status: JobStatus,
    /// Progress (0-100)
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub quality: AudioQuality,
    #[serde(default)]
    pub format: AudioFormat,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message, only present while failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a worker may reserve the job
    pub run_after: DateTime<Utc>,
}

impl DownloadJob {
    /// Create a new queued job.
    pub fn new(
        source_url: impl Into<String>,
        client_channel: impl Into<String>,
        priority: Priority,
        quality: AudioQuality,
        format: AudioFormat,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            source_url: source_url.into(),
            client_channel: client_channel.into(),
            status: JobStatus::Queued,
            progress: 0,
            metadata: None,
            priority,
            quality,
            format,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            last_retry_at: None,
            updated_at: now,
            run_after: now,
        }
    }

    /// Delay the first reservation by `delay` from now.
    pub fn scheduled_in(mut self, delay: Duration) -> Self {
        self.run_after = Utc::now() + to_chrono(delay);
        self
    }

    /// Check if job can be retried.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < MAX_RETRIES
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time elapsed since the job was created.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// When the job reached its terminal status.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.is_terminal().then_some(self.updated_at)
    }

    /// `Queued -> Downloading` on reservation.
    pub fn start(&self) -> Result<Self, TransitionError> {
        let mut next = self.guard(JobAction::Start, &[JobStatus::Queued])?;
        next.status = JobStatus::Downloading;
        next.progress = 0;
        next.started_at.get_or_insert(next.updated_at);
        Ok(next)
    }

    /// Record progress. Never lowers the stored value while a worker owns the job.
    pub fn with_progress(&self, progress: u8) -> Result<Self, TransitionError> {
        let mut next = self.guard(
            JobAction::Progress,
            &[JobStatus::Downloading, JobStatus::Paused],
        )?;
        next.progress = next.progress.max(progress.min(100));
        Ok(next)
    }

    /// Attach the metadata fetched from the upstream.
    pub fn with_metadata(&self, metadata: MediaMetadata) -> Result<Self, TransitionError> {
        let mut next = self.guard(
            JobAction::AttachMetadata,
            &[JobStatus::Downloading, JobStatus::Paused],
        )?;
        next.metadata = Some(metadata);
        Ok(next)
    }

    /// `Downloading -> Completed`.
    pub fn complete(&self) -> Result<Self, TransitionError> {
        let mut next = self.guard(JobAction::Complete, &[JobStatus::Downloading])?;
        next.status = JobStatus::Completed;
        next.progress = 100;
        next.completed_at.get_or_insert(next.updated_at);
        Ok(next)
    }

    /// `Downloading | Paused -> Failed`, counting the failed attempt.
    pub fn fail(&self, error: impl Into<String>) -> Result<Self, TransitionError> {
        let mut next = self.guard(
            JobAction::Fail,
            &[JobStatus::Downloading, JobStatus::Paused],
        )?;
        next.status = JobStatus::Failed;
        next.error = Some(error.into());
        next.retry_count = (next.retry_count + 1).min(MAX_RETRIES);
        next.last_retry_at = Some(next.updated_at);
        Ok(next)
    }

    /// `Failed -> Queued`, only while the retry budget lasts.
    pub fn requeue(&self, delay: Duration) -> Result<Self, TransitionError> {
        if !self.can_retry() {
            return Err(TransitionError::new(self.status, JobAction::Requeue));
        }
        let mut next = self.guard(JobAction::Requeue, &[JobStatus::Failed])?;
        next.status = JobStatus::Queued;
        next.error = None;
        next.progress = 0;
        next.run_after = next.updated_at + to_chrono(delay);
        Ok(next)
    }

    /// Fail the current attempt and, if `retryable` and budget remains,
    /// put the job back in the queue after `backoff(retry_count)`.
    ///
    /// Applied as one update, so a stored `Failed` snapshot is always final.
    pub fn fail_or_requeue<F>(
        &self,
        error: impl Into<String>,
        retryable: bool,
        backoff: F,
    ) -> Result<Self, TransitionError>
    where
        F: FnOnce(u32) -> Duration,
    {
        let failed = self.fail(error)?;
        if retryable && failed.can_retry() {
            let delay = backoff(failed.retry_count);
            failed.requeue(delay)
        } else {
            Ok(failed)
        }
    }

    /// `Downloading -> Paused`.
    pub fn pause(&self) -> Result<Self, TransitionError> {
        let mut next = self.guard(JobAction::Pause, &[JobStatus::Downloading])?;
        next.status = JobStatus::Paused;
        Ok(next)
    }

    /// `Paused -> Downloading`.
    pub fn resume(&self) -> Result<Self, TransitionError> {
        let mut next = self.guard(JobAction::Resume, &[JobStatus::Paused])?;
        next.status = JobStatus::Downloading;
        Ok(next)
    }

    /// `Queued | Downloading | Paused -> Cancelled`.
    pub fn cancel(&self) -> Result<Self, TransitionError> {
        let mut next = self.guard(
            JobAction::Cancel,
            &[JobStatus::Queued, JobStatus::Downloading, JobStatus::Paused],
        )?;
        next.status = JobStatus::Cancelled;
        Ok(next)
    }

    /// Recover a job whose reservation stopped heartbeating.
    ///
    /// A reserved job counts a failed attempt and is requeued when budget
    /// remains, otherwise it fails. A job that was reserved but never
    /// started goes straight back to the queue.
    pub fn recover_stalled<F>(&self, backoff: F) -> Result<Self, TransitionError>
    where
        F: FnOnce(u32) -> Duration,
    {
        match self.status {
            JobStatus::Queued => {
                let mut next = self.guard(JobAction::RecoverStalled, &[JobStatus::Queued])?;
                next.run_after = next.updated_at;
                Ok(next)
            }
            JobStatus::Downloading | JobStatus::Paused => {
                self.fail_or_requeue(STALL_ERROR, true, backoff)
            }
            status => Err(TransitionError::new(status, JobAction::RecoverStalled)),
        }
    }

    fn guard(&self, action: JobAction, allowed: &[JobStatus]) -> Result<Self, TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError::new(self.status, action));
        }
        let mut next = self.clone();
        next.updated_at = Utc::now().max(self.updated_at);
        Ok(next)
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    // Out-of-range delays are capped far in the future instead of overflowing.
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
