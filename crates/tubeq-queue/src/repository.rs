//! Queue repository contract.
//!
//! The repository is the single source of truth for job state. Every write
//! goes through [`QueueRepository::modify`], which applies a pure transition
//! from `tubeq_models` to the stored snapshot and commits it with an
//! optimistic version check. Workers hold a lease on the jobs they reserve;
//! writes made with a lease only succeed while that lease is current, so a
//! worker that was fenced off (cancelled job, stall recovery) cannot clobber
//! newer state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tubeq_models::{DownloadJob, JobId, JobStatus, QueueStats, TransitionError};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Transition applied by [`QueueRepository::modify`].
///
/// May run more than once when a concurrent writer wins the version race.
pub type Transition<'a> =
    &'a (dyn Fn(&DownloadJob) -> Result<DownloadJob, TransitionError> + Send + Sync);

/// Compare-and-set attempts before giving up with `Contention`.
pub const MAX_CAS_ATTEMPTS: usize = 8;

/// Opaque token proving ownership of a reserved job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A job handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub job: DownloadJob,
    pub lease: LeaseToken,
}

impl Reservation {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }
}

/// Age thresholds and batch sizes for evicting finished jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_batch: usize,
    pub cancelled_age: Duration,
    pub cancelled_batch: usize,
    pub failed_age: Duration,
    pub failed_batch: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(60 * 60),
            completed_batch: 100,
            cancelled_age: Duration::from_secs(60 * 60),
            cancelled_batch: 100,
            failed_age: Duration::from_secs(24 * 60 * 60),
            failed_batch: 50,
        }
    }
}

impl RetentionPolicy {
    /// `(age, batch)` for a terminal status.
    pub fn rule(&self, status: JobStatus) -> Option<(Duration, usize)> {
        match status {
            JobStatus::Completed => Some((self.completed_age, self.completed_batch)),
            JobStatus::Cancelled => Some((self.cancelled_age, self.cancelled_batch)),
            JobStatus::Failed => Some((self.failed_age, self.failed_batch)),
            _ => None,
        }
    }

    /// Finish time before which a job in `status` may be evicted.
    pub fn cutoff(&self, status: JobStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (age, _) = self.rule(status)?;
        let age = chrono::Duration::from_std(age).ok()?;
        Some(now - age)
    }
}

/// Number of jobs evicted per terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub(crate) fn record(&mut self, status: JobStatus, removed: usize) {
        match status {
            JobStatus::Completed => self.completed += removed,
            JobStatus::Failed => self.failed += removed,
            JobStatus::Cancelled => self.cancelled += removed,
            _ => {}
        }
    }
}

/// Whether the lease survives a write that produces `next`.
pub(crate) fn keeps_lease(next: &DownloadJob) -> bool {
    next.status.is_reserved()
}

/// Persistent job store shared by producers and workers.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Persist a new job and return its id.
    async fn add_job(&self, job: DownloadJob) -> QueueResult<JobId>;

    /// `None` for unknown ids.
    async fn get_job_by_id(&self, id: &JobId) -> QueueResult<Option<DownloadJob>>;

    async fn get_jobs_by_status(&self, status: JobStatus) -> QueueResult<Vec<DownloadJob>>;

    /// Number of `Queued` plus `Downloading` jobs.
    async fn count_active(&self) -> QueueResult<usize>;

    async fn get_queue_stats(&self) -> QueueResult<QueueStats>;

    /// Evict terminal jobs that finished before their retention cutoff.
    async fn cleanup_finished(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<CleanupReport>;

    /// Reserve the next eligible job for `worker`.
    ///
    /// Picks the highest priority, then earliest eligible job. The job is
    /// leased to the caller but still `Queued`; the worker applies
    /// [`DownloadJob::start`] through [`QueueRepository::modify`].
    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>>;

    /// Apply `transition` to the stored snapshot with compare-and-set.
    ///
    /// With `lease`, the write only succeeds while the lease is current.
    /// Transitions into a non-reserved status drop the lease.
    async fn modify(
        &self,
        id: &JobId,
        lease: Option<&LeaseToken>,
        transition: Transition<'_>,
    ) -> QueueResult<DownloadJob>;

    /// Refresh the reservation and return the current snapshot.
    async fn heartbeat(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<DownloadJob>;

    /// Take over reservations whose heartbeat is older than `idle`.
    async fn claim_stalled(
        &self,
        worker: &str,
        idle: Duration,
        limit: usize,
    ) -> QueueResult<Vec<Reservation>>;

    /// Give a reservation back without a state change.
    ///
    /// A job that is still `Queued` becomes eligible again.
    async fn release(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<()>;

    async fn get_active_jobs(&self) -> QueueResult<Vec<DownloadJob>> {
        let mut jobs = self.get_jobs_by_status(JobStatus::Queued).await?;
        jobs.extend(self.get_jobs_by_status(JobStatus::Downloading).await?);
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn cleanup_old_jobs(&self, retention: &RetentionPolicy) -> QueueResult<CleanupReport> {
        self.cleanup_finished(retention, Utc::now()).await
    }

    /// Record progress for a reserved job. Idempotent, never lowers progress.
    async fn update_progress(
        &self,
        id: &JobId,
        lease: &LeaseToken,
        progress: u8,
    ) -> QueueResult<DownloadJob> {
        self.modify(id, Some(lease), &move |job: &DownloadJob| job.with_progress(progress))
            .await
    }

    /// Move a job to `status`. A job already in `status` is returned unchanged.
    async fn update_status(
        &self,
        id: &JobId,
        lease: Option<&LeaseToken>,
        status: JobStatus,
        error: Option<String>,
    ) -> QueueResult<DownloadJob> {
        let transition = move |job: &DownloadJob| -> Result<DownloadJob, TransitionError> {
            if job.status == status {
                return Ok(job.clone());
            }
            match status {
                JobStatus::Downloading if job.status == JobStatus::Paused => job.resume(),
                JobStatus::Downloading => job.start(),
                JobStatus::Paused => job.pause(),
                JobStatus::Completed => job.complete(),
                JobStatus::Failed => job.fail(error.clone().unwrap_or_else(|| "failed".to_string())),
                JobStatus::Queued => job.requeue(Duration::ZERO),
                JobStatus::Cancelled => job.cancel(),
            }
        };
        self.modify(id, lease, &transition).await
    }

    /// `Downloading -> Paused`; `Conflict` otherwise.
    async fn pause_job(&self, id: &JobId) -> QueueResult<DownloadJob> {
        self.modify(id, None, &|job: &DownloadJob| job.pause()).await
    }

    /// `Paused -> Downloading`; `Conflict` otherwise.
    async fn resume_job(&self, id: &JobId) -> QueueResult<DownloadJob> {
        self.modify(id, None, &|job: &DownloadJob| job.resume()).await
    }

    /// Cancel a non-terminal job and fence off its worker.
    async fn cancel_job(&self, id: &JobId) -> QueueResult<DownloadJob> {
        self.modify(id, None, &|job: &DownloadJob| job.cancel()).await
    }
}

/// Map a missing job to `JobNotFound`.
pub(crate) fn require(id: &JobId, job: Option<DownloadJob>) -> QueueResult<DownloadJob> {
    job.ok_or_else(|| QueueError::not_found(id))
}
