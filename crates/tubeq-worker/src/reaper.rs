//! Background maintenance: stall recovery and retention cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use tubeq_models::{DownloadJob, JobStatus, ProgressPhase, STALL_ERROR};
use tubeq_queue::{CleanupReport, JobEvents, QueueRepository, RetentionPolicy};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::metrics;
use crate::retry::RetryPolicy;

/// Stalled reservations recovered per scan.
const STALL_BATCH: usize = 16;

/// Recovers jobs whose worker stopped heartbeating.
///
/// A started job counts a failed attempt and goes back to the queue while
/// its retry budget lasts, otherwise it fails. A job that was reserved but
/// never started is simply made eligible again.
pub struct StallReaper {
    repo: Arc<dyn QueueRepository>,
    events: JobEvents,
    retry: RetryPolicy,
    stall_timeout: Duration,
    interval: Duration,
    worker_name: String,
}

impl StallReaper {
    pub fn new(config: &WorkerConfig, repo: Arc<dyn QueueRepository>, events: JobEvents) -> Self {
        Self {
            repo,
            events,
            retry: config.retry.clone(),
            stall_timeout: config.stall_timeout,
            interval: config.claim_interval,
            worker_name: config.worker_name.clone(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.reap_once().await {
                        Ok(0) => {}
                        Ok(n) => info!("Recovered {} stalled jobs", n),
                        Err(e) => warn!("Failed to scan for stalled jobs: {}", e),
                    }
                }
            }
        }
        debug!("Stall reaper stopped");
    }

    /// One scan. Returns the number of jobs recovered.
    pub async fn reap_once(&self) -> WorkerResult<usize> {
        let claimed = self
            .repo
            .claim_stalled(&self.worker_name, self.stall_timeout, STALL_BATCH)
            .await?;

        let mut recovered = 0;
        for reservation in claimed {
            let was_started = reservation.job.status.is_reserved();
            let retry = self.retry.clone();
            let recover = move |job: &DownloadJob| {
                if job.status.is_reserved() && !retry.allows_retry(job.retry_count + 1) {
                    job.fail(STALL_ERROR)
                } else {
                    job.recover_stalled(|n| retry.backoff(n))
                }
            };

            let job = match self
                .repo
                .modify(reservation.id(), Some(&reservation.lease), &recover)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %reservation.id(), error = %e, "Failed to recover stalled job");
                    continue;
                }
            };
            recovered += 1;

            if !was_started {
                debug!(job_id = %job.id, "Reservation was never started, job eligible again");
                continue;
            }

            metrics::record_job_stalled();
            warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                "Stalled job recovered as {}", job.status
            );
            if job.status == JobStatus::Queued {
                metrics::record_job_retried();
                self.events
                    .emit_with_message(&job, ProgressPhase::Retrying, STALL_ERROR)
                    .await;
            } else {
                metrics::record_job_failed("stalled");
                self.events
                    .emit_with_message(&job, ProgressPhase::Failed, STALL_ERROR)
                    .await;
            }
        }
        Ok(recovered)
    }
}

/// Periodically evicts finished jobs past their retention.
pub struct CleanupScheduler {
    repo: Arc<dyn QueueRepository>,
    retention: RetentionPolicy,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(config: &WorkerConfig, repo: Arc<dyn QueueRepository>) -> Self {
        Self {
            repo,
            retention: config.retention,
            interval: config.cleanup_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("Cleanup failed: {}", e);
                    }
                }
            }
        }
        debug!("Cleanup scheduler stopped");
    }

    pub async fn run_once(&self) -> WorkerResult<CleanupReport> {
        let report = self.repo.cleanup_old_jobs(&self.retention).await?;
        if report.total() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "Evicted finished jobs"
            );
        }
        metrics::record_jobs_evicted(JobStatus::Completed, report.completed);
        metrics::record_jobs_evicted(JobStatus::Failed, report.failed);
        metrics::record_jobs_evicted(JobStatus::Cancelled, report.cancelled);

        match self.repo.get_queue_stats().await {
            Ok(stats) => metrics::set_queue_stats(&stats),
            Err(e) => debug!("Failed to read queue stats: {}", e),
        }
        Ok(report)
    }
}
