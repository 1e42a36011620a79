//! Producer-facing operations.
//!
//! [`DownloadService`] is what an HTTP or RPC layer calls: it validates and
//! admits new requests, forwards pause/resume/cancel to the repository and
//! to any attempt running in this process, and answers queries.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tubeq_media::MediaFetchService;
use tubeq_models::{DownloadJob, DownloadRequest, JobId, JobStatus, JobStatusView, QueueStats};
use tubeq_queue::{CleanupReport, JobEvents, QueueRepository, RetentionPolicy};
use validator::Validate;

use crate::config::AdmissionConfig;
use crate::control::JobControls;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

pub struct DownloadService {
    repo: Arc<dyn QueueRepository>,
    media: Arc<dyn MediaFetchService>,
    events: JobEvents,
    controls: JobControls,
    admission: AdmissionConfig,
    retention: RetentionPolicy,
    /// Serializes the capacity check with the insert it guards.
    admission_lock: Mutex<()>,
}

impl DownloadService {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        media: Arc<dyn MediaFetchService>,
        events: JobEvents,
        controls: JobControls,
        admission: AdmissionConfig,
    ) -> Self {
        Self {
            repo,
            media,
            events,
            controls,
            admission,
            retention: RetentionPolicy::default(),
            admission_lock: Mutex::new(()),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Validate, admit and store a new job.
    ///
    /// Fails with `Validation` for malformed or unsupported URLs and with
    /// `Capacity` once the active-job cap is reached.
    pub async fn enqueue(&self, request: DownloadRequest) -> WorkerResult<DownloadJob> {
        request.validate()?;
        if !self.media.validate_url(&request.url) {
            return Err(WorkerError::validation(format!(
                "unsupported media URL: {}",
                request.url
            )));
        }

        let _admission = self.admission_lock.lock().await;
        let active = self.repo.count_active().await?;
        if active >= self.admission.max_active {
            metrics::record_admission_rejected();
            return Err(WorkerError::Capacity {
                active,
                limit: self.admission.max_active,
            });
        }

        let job = request.into_job().scheduled_in(self.admission.start_delay());
        self.repo.add_job(job.clone()).await?;

        metrics::record_job_enqueued(job.priority);
        info!(job_id = %job.id, channel = %job.client_channel, "Job enqueued");
        self.events.emit_status(&job).await;
        Ok(job)
    }

    /// `Downloading -> Paused`. The fetch parks at its next chunk boundary.
    pub async fn pause(&self, id: &JobId) -> WorkerResult<DownloadJob> {
        let job = self.repo.pause_job(id).await?;
        self.controls.apply(id, job.status);
        self.events.emit_status(&job).await;
        Ok(job)
    }

    /// `Paused -> Downloading`.
    pub async fn resume(&self, id: &JobId) -> WorkerResult<DownloadJob> {
        let job = self.repo.resume_job(id).await?;
        self.controls.apply(id, job.status);
        self.events.emit_status(&job).await;
        Ok(job)
    }

    /// Cancel a non-terminal job. A queued job never starts; a running one
    /// stops at its next chunk boundary.
    pub async fn cancel(&self, id: &JobId) -> WorkerResult<DownloadJob> {
        let job = self.repo.cancel_job(id).await?;
        self.controls.apply(id, job.status);
        self.events.emit_status(&job).await;
        info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> WorkerResult<DownloadJob> {
        self.repo
            .get_job_by_id(id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(id.to_string()))
    }

    pub async fn query(&self, id: &JobId) -> WorkerResult<JobStatusView> {
        let job = self.get_job(id).await?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn jobs_by_status(&self, status: JobStatus) -> WorkerResult<Vec<DownloadJob>> {
        Ok(self.repo.get_jobs_by_status(status).await?)
    }

    pub async fn active_jobs(&self) -> WorkerResult<Vec<DownloadJob>> {
        Ok(self.repo.get_active_jobs().await?)
    }

    pub async fn stats(&self) -> WorkerResult<QueueStats> {
        Ok(self.repo.get_queue_stats().await?)
    }

    pub async fn cleanup(&self) -> WorkerResult<CleanupReport> {
        Ok(self.repo.cleanup_old_jobs(&self.retention).await?)
    }
}
