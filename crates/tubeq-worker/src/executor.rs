//! Job executor.
//!
//! A fixed number of slots (`WORKER_MAX_JOBS`) bounds concurrent attempts.
//! Each reserved job runs in its own task behind a second task boundary, so
//! a panic is contained to that job and recorded as its failure. While an
//! attempt runs, a heartbeat task keeps the reservation alive and mirrors
//! the stored status (pause, resume, cancel) into the attempt's
//! [`FetchControl`]. Every attempt has a wall-clock ceiling that keeps
//! running while the job is paused, so no job holds a slot indefinitely.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use tubeq_media::{FetchControl, FetchError, FetchRequest, FetchedMedia, MediaFetchService, ProgressSink};
use tubeq_models::{DownloadJob, JobId, JobStatus, ProgressPhase};
use tubeq_queue::{JobEvents, LeaseToken, QueueError, QueueRepository, Reservation};

use crate::config::WorkerConfig;
use crate::control::{mirror_status, JobControls};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::progress::{forward_progress, ProgressTracker};
use crate::retry::{retry_async, LogThrottle, StoreRetry};

/// Raw progress updates buffered between a fetch and its forwarder.
const PROGRESS_BUFFER: usize = 64;

/// Pause before reserving again after a store error.
const RESERVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Dependencies shared by every job task.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub repo: Arc<dyn QueueRepository>,
    pub media: Arc<dyn MediaFetchService>,
    pub events: JobEvents,
    pub controls: JobControls,
}

/// Job executor that processes jobs from the repository.
pub struct JobExecutor {
    ctx: Arc<WorkerContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        repo: Arc<dyn QueueRepository>,
        media: Arc<dyn MediaFetchService>,
        events: JobEvents,
        controls: JobControls,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: Arc::new(WorkerContext {
                config,
                repo,
                media,
                events,
                controls,
            }),
            job_semaphore,
            shutdown,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.ctx.config.worker_name
    }

    /// Slots not currently held by a running or paused job.
    pub fn available_slots(&self) -> usize {
        self.job_semaphore.available_permits()
    }

    /// Receiver that flips to `true` when shutdown is requested.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Reserve and run jobs until shutdown, then drain in-flight work.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.worker_name(),
            self.ctx.config.max_concurrent_jobs
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut reserve_failures = LogThrottle::new(3);

        while !*shutdown_rx.borrow() {
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                permit = Arc::clone(&self.job_semaphore).acquire_owned() => permit
                    .map_err(|_| WorkerError::config("job semaphore closed"))?,
            };

            match self.ctx.repo.reserve_next(self.worker_name()).await {
                Ok(Some(reservation)) => {
                    reserve_failures.ok();
                    debug!(job_id = %reservation.id(), "Reserved job");
                    self.spawn_job(reservation, permit);
                }
                Ok(None) => {
                    reserve_failures.ok();
                    drop(permit);
                    idle(&mut shutdown_rx, self.ctx.config.poll_interval).await;
                }
                Err(e) => {
                    if reserve_failures.failed() {
                        error!("Failed to reserve next job: {}", e);
                    }
                    drop(permit);
                    idle(&mut shutdown_rx, RESERVE_ERROR_BACKOFF).await;
                }
            }
        }

        info!("Shutdown signal received, waiting for in-flight jobs to complete...");
        let slots = self.ctx.config.max_concurrent_jobs as u32;
        match tokio::time::timeout(
            self.ctx.config.shutdown_timeout,
            self.job_semaphore.acquire_many(slots),
        )
        .await
        {
            Ok(_) => info!("Job executor stopped"),
            Err(_) => {
                warn!(
                    "Shutdown timeout reached with {} jobs still running; stall recovery will requeue them",
                    self.ctx.controls.len()
                );
                // Stop the fetches so their child processes go away with us
                self.ctx.controls.cancel_all();
            }
        }
        Ok(())
    }

    fn spawn_job(&self, reservation: Reservation, permit: OwnedSemaphorePermit) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let _permit = permit;
            run_isolated(ctx, reservation).await;
        });
    }
}

/// Sleep for `period` unless shutdown is requested first.
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, period: Duration) {
    tokio::select! {
        _ = shutdown_rx.changed() => {}
        _ = tokio::time::sleep(period) => {}
    }
}

/// Run one reservation behind a task boundary and record a panic as its failure.
async fn run_isolated(ctx: Arc<WorkerContext>, reservation: Reservation) {
    let id = reservation.id().clone();
    let lease = reservation.lease.clone();
    let logger = JobLogger::for_job(&reservation.job, &ctx.config.worker_name);
    let span = logger.span();

    let handle = tokio::spawn(
        execute_job(Arc::clone(&ctx), reservation, logger.clone()).instrument(span),
    );
    let Err(join_error) = handle.await else {
        return;
    };

    ctx.controls.remove(&id);
    let message = if join_error.is_panic() {
        "worker panicked while processing the job"
    } else {
        "job task was aborted"
    };
    logger.error(message);

    let fail = |job: &DownloadJob| job.fail(message);
    match ctx.repo.modify(&id, Some(&lease), &fail).await {
        Ok(job) => {
            metrics::record_job_failed("panic");
            ctx.events
                .emit_with_message(&job, ProgressPhase::Failed, message)
                .await;
        }
        // Never started; hand the reservation back
        Err(QueueError::Conflict(_)) => {
            if let Err(e) = ctx.repo.release(&id, &lease).await {
                logger.warn(&format!("Failed to release reservation: {}", e));
            }
        }
        Err(e) => logger.warn(&format!("Failed to record panic: {}", e)),
    }
}

/// Process a single reservation from start to recorded outcome.
async fn execute_job(ctx: Arc<WorkerContext>, reservation: Reservation, logger: JobLogger) {
    let Reservation { job, lease } = reservation;
    let id = job.id.clone();

    let start = |job: &DownloadJob| job.start();
    let job = match ctx.repo.modify(&id, Some(&lease), &start).await {
        Ok(job) => job,
        // Cancelled or otherwise moved on before we started; hand the reservation back
        Err(QueueError::Conflict(e)) => {
            logger.warn(&format!("Reservation not started: {}", e));
            if let Err(e) = ctx.repo.release(&id, &lease).await {
                logger.warn(&format!("Failed to release reservation: {}", e));
            }
            return;
        }
        // Lease already taken over; whoever holds it owns the job now
        Err(e) => {
            logger.warn(&format!("Reservation not started: {}", e));
            return;
        }
    };

    logger.started(&job.source_url);
    ctx.events.emit(&job, ProgressPhase::FetchingMetadata).await;

    let control = ctx.controls.register(&id);
    let _heartbeat = AbortOnDrop(tokio::spawn(
        heartbeat_loop(
            Arc::clone(&ctx.repo),
            id.clone(),
            lease.clone(),
            control.clone(),
            ctx.config.heartbeat_interval,
        )
        .in_current_span(),
    ));

    let started = Instant::now();
    let budget = ctx.config.attempt_timeout;
    let attempt = run_attempt(&ctx, &job, &lease, &control);
    let outcome = match with_deadline(attempt, budget).await {
        Ok(media) => store_output(&ctx.config.output_dir, &id, &media)
            .await
            .map(|path| (path, media.len())),
        Err(e) => Err(e),
    };

    let outcome = match outcome {
        Ok((path, bytes)) => {
            finish_success(&ctx, &job, &lease, &control, &logger, &path, bytes, started).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        finish_failure(&ctx, &id, &lease, &logger, e).await;
    }

    ctx.controls.remove(&id);
}

/// Aborts the task when dropped, including while a panic unwinds.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Metadata, then fetch and convert with progress forwarding.
async fn run_attempt(
    ctx: &WorkerContext,
    job: &DownloadJob,
    lease: &LeaseToken,
    control: &FetchControl,
) -> WorkerResult<FetchedMedia> {
    control.checkpoint().await?;
    let metadata = ctx.media.fetch_metadata(&job.source_url).await?;

    let mut tracker = ProgressTracker::new(ctx.config.progress).resume_from(job.progress);
    let progress = tracker.metadata_done();
    let attach = move |current: &DownloadJob| {
        current
            .with_metadata(metadata.clone())?
            .with_progress(progress)
    };
    let job = ctx.repo.modify(&job.id, Some(lease), &attach).await?;
    ctx.events.emit(&job, ProgressPhase::FetchingMetadata).await;

    let (sink, rx) = ProgressSink::channel(PROGRESS_BUFFER);
    let forwarder = tokio::spawn(
        forward_progress(
            Arc::clone(&ctx.repo),
            ctx.events.clone(),
            job.id.clone(),
            lease.clone(),
            tracker,
            rx,
        )
        .in_current_span(),
    );

    let result = ctx
        .media
        .fetch_and_convert(&FetchRequest::for_job(&job), sink, control.clone())
        .await;

    // The sink is dropped with the fetch, so the forwarder drains and exits
    if let Err(e) = forwarder.await {
        warn!(job_id = %job.id, "Progress forwarder failed: {}", e);
    }

    result.map_err(WorkerError::from)
}

/// Bound `attempt` by `budget` of wall-clock time, paused time included.
///
/// An attempt past its ceiling is dropped and reported as a retryable timeout.
pub async fn with_deadline<F, T>(attempt: F, budget: Duration) -> WorkerResult<T>
where
    F: Future<Output = WorkerResult<T>>,
{
    match tokio::time::timeout(budget, attempt).await {
        Ok(out) => out,
        Err(_) => Err(timed_out(budget)),
    }
}

fn timed_out(budget: Duration) -> WorkerError {
    FetchError::Timeout(budget.as_secs()).into()
}

/// Keep the reservation alive and mirror the stored status into `control`.
async fn heartbeat_loop(
    repo: Arc<dyn QueueRepository>,
    id: JobId,
    lease: LeaseToken,
    control: FetchControl,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    let mut failures = LogThrottle::new(3);

    loop {
        interval.tick().await;
        match repo.heartbeat(&id, &lease).await {
            Ok(job) => {
                failures.ok();
                mirror_status(&control, job.status);
            }
            Err(QueueError::LeaseLost(_)) | Err(QueueError::JobNotFound(_)) => {
                warn!(job_id = %id, "Reservation lost, stopping attempt");
                control.cancel();
                return;
            }
            Err(e) => {
                if failures.failed() {
                    warn!(job_id = %id, error = %e, "Heartbeat failed");
                }
            }
        }
    }
}

/// Write the converted media to `{dir}/{job_id}.{ext}`.
async fn store_output(dir: &str, id: &JobId, media: &FetchedMedia) -> WorkerResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = Path::new(dir).join(format!("{}.{}", id, media.extension()));
    let partial = Path::new(dir).join(format!("{}.{}.part", id, media.extension()));
    tokio::fs::write(&partial, &media.data).await?;
    tokio::fs::rename(&partial, &path).await?;
    Ok(path)
}

#[allow(clippy::too_many_arguments)]
async fn finish_success(
    ctx: &WorkerContext,
    job: &DownloadJob,
    lease: &LeaseToken,
    control: &FetchControl,
    logger: &JobLogger,
    path: &Path,
    bytes: usize,
    started: Instant,
) -> WorkerResult<()> {
    let retry = StoreRetry::new("record_completion");
    let budget = ctx.config.attempt_timeout;
    let mut ceiling_hit = None;
    let complete = |current: &DownloadJob| current.complete();

    let completed = loop {
        let result = retry_async(&retry, QueueError::is_persistence, || {
            ctx.repo.modify(&job.id, Some(lease), &complete)
        })
        .await;

        match result {
            Ok(done) => break Some(done),
            // Paused after the last chunk; wait for resume within the same ceiling
            Err(QueueError::Conflict(e)) if e.from == JobStatus::Paused => {
                control.pause();
                match tokio::time::timeout_at(started + budget, control.checkpoint()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break None,
                    Err(_) => {
                        ceiling_hit = Some(timed_out(budget));
                        break None;
                    }
                }
            }
            Err(e) => {
                logger.warn(&format!("Completion not recorded: {}", e));
                break None;
            }
        }
    };

    match completed {
        Some(done) => {
            metrics::record_job_completed(job.format.extension(), started.elapsed().as_secs_f64());
            ctx.events.emit(&done, ProgressPhase::Completed).await;
            logger.completed(path, bytes);
        }
        None => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!("Failed to remove orphaned output {}: {}", path.display(), e);
            }
        }
    }
    ceiling_hit.map_or(Ok(()), Err)
}

async fn finish_failure(
    ctx: &WorkerContext,
    id: &JobId,
    lease: &LeaseToken,
    logger: &JobLogger,
    err: WorkerError,
) {
    match err {
        WorkerError::Cancelled => {
            logger.info("Attempt cancelled");
            return;
        }
        WorkerError::Stall(_) => {
            logger.warn(&format!("Attempt fenced off: {}", err));
            return;
        }
        _ => {}
    }

    let retryable = err.is_retryable();
    let message = err.to_string();
    let policy = ctx.config.retry.clone();
    let transition = move |job: &DownloadJob| {
        let allowed = retryable && policy.allows_retry(job.retry_count + 1);
        job.fail_or_requeue(message.clone(), allowed, |n| policy.backoff(n))
    };

    let retry = StoreRetry::new("record_failure");
    let result = retry_async(&retry, QueueError::is_persistence, || {
        ctx.repo.modify(id, Some(lease), &transition)
    })
    .await;

    match result {
        Ok(job) if job.status == JobStatus::Queued => {
            metrics::record_job_retried();
            logger.warn(&format!(
                "Attempt failed, retry {} scheduled at {}: {}",
                job.retry_count, job.run_after, err
            ));
            ctx.events
                .emit_with_message(&job, ProgressPhase::Retrying, err.to_string())
                .await;
        }
        Ok(job) => {
            metrics::record_job_failed(err.reason());
            logger.error(&format!(
                "Job failed after {} attempt(s): {}",
                job.retry_count, err
            ));
            ctx.events
                .emit_with_message(&job, ProgressPhase::Failed, err.to_string())
                .await;
        }
        Err(QueueError::LeaseLost(_)) => {
            logger.warn(&format!("Outcome not recorded, reservation lost: {}", err));
        }
        Err(e) => logger.error(&format!("Failed to record failure ({}): {}", err, e)),
    }
}
