//! End-to-end worker scenarios against the in-memory queue.
//!
//! The media service is a scripted fake, so these run without network,
//! Redis or yt-dlp. Timings are short real-time waits.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tubeq_media::{
    is_youtube_url, video_id, FetchControl, FetchError, FetchRequest, FetchResult, FetchedMedia,
    MediaFetchService, ProgressSink,
};
use tubeq_models::{
    AudioQuality, DownloadJob, DownloadRequest, JobId, JobStatus, MediaMetadata, ProgressEvent,
    ProgressPhase, Priority, AudioFormat,
};
use tubeq_queue::{JobEvents, LocalBroadcaster, MemoryQueue, QueueRepository};
use tubeq_worker::{
    AdmissionConfig, DownloadService, JobControls, JobExecutor, RetryPolicy, StallReaper,
    WorkerConfig, WorkerError,
};

const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
const CHANNEL: &str = "client-1";

/// What the fake does on one `fetch_and_convert` call.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Succeed,
    RateLimited,
    NotFound,
    Panic,
    Hang,
}

struct FakeMedia {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    chunks: u64,
    chunk_delay: Duration,
    fetches: AtomicUsize,
}

impl FakeMedia {
    fn new(fallback: Step) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            chunks: 4,
            chunk_delay: Duration::from_millis(5),
            fetches: AtomicUsize::new(0),
        }
    }

    fn scripted(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script = Mutex::new(steps.into_iter().collect());
        self
    }

    fn chunks(mut self, chunks: u64, delay: Duration) -> Self {
        self.chunks = chunks;
        self.chunk_delay = delay;
        self
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl MediaFetchService for FakeMedia {
    fn validate_url(&self, url: &str) -> bool {
        is_youtube_url(url)
    }

    async fn fetch_metadata(&self, url: &str) -> FetchResult<MediaMetadata> {
        Ok(MediaMetadata {
            title: "Test Track".to_string(),
            author: "Test Artist".to_string(),
            duration_secs: 212,
            thumbnail_url: "https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg".to_string(),
            quality: "160kbps".to_string(),
            size_bytes: Some(self.chunks * 1024),
            source_id: video_id(url).unwrap_or_default(),
        })
    }

    async fn fetch_and_convert(
        &self,
        request: &FetchRequest,
        progress: ProgressSink,
        control: FetchControl,
    ) -> FetchResult<FetchedMedia> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();

        match step {
            Step::Panic => panic!("scripted fetch panic"),
            Step::Hang => loop {
                control.checkpoint().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            _ => {}
        }

        let total = self.chunks * 1024;
        for chunk in 1..=self.chunks {
            control.checkpoint().await?;
            tokio::time::sleep(self.chunk_delay).await;
            progress.transfer(chunk * 1024, Some(total));

            if step == Step::RateLimited && chunk == 1 {
                return Err(FetchError::rate_limited(
                    "HTTP Error 429: Too Many Requests",
                ));
            }
        }
        if step == Step::NotFound {
            return Err(FetchError::NotFound("Video unavailable".to_string()));
        }

        control.checkpoint().await?;
        progress.converting(0.5);
        progress.converting(1.0);
        Ok(FetchedMedia::new(vec![7u8; 16], request.format))
    }
}

struct Harness {
    repo: Arc<MemoryQueue>,
    local: Arc<LocalBroadcaster>,
    media: Arc<FakeMedia>,
    events: JobEvents,
    config: WorkerConfig,
    service: DownloadService,
    executor: Arc<JobExecutor>,
    _dir: TempDir,
}

fn test_config(dir: &Path) -> WorkerConfig {
    WorkerConfig {
        worker_name: "test-worker".to_string(),
        max_concurrent_jobs: 2,
        attempt_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_millis(50),
        stall_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        work_dir: dir.join("work").display().to_string(),
        output_dir: dir.join("out").display().to_string(),
        retry: RetryPolicy::immediate(),
        ..Default::default()
    }
}

impl Harness {
    fn new(media: FakeMedia) -> Self {
        Self::build(media, AdmissionConfig::immediate(5), |_| {})
    }

    fn build(
        media: FakeMedia,
        admission: AdmissionConfig,
        tweak: impl FnOnce(&mut WorkerConfig),
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let repo = Arc::new(MemoryQueue::new());
        let local = Arc::new(LocalBroadcaster::new());
        let media = Arc::new(media);
        let events = JobEvents::new(local.clone());
        let controls = JobControls::new();

        let service = DownloadService::new(
            repo.clone(),
            media.clone(),
            events.clone(),
            controls.clone(),
            admission,
        );
        let executor = Arc::new(JobExecutor::new(
            config.clone(),
            repo.clone(),
            media.clone(),
            events.clone(),
            controls,
        ));

        Self {
            repo,
            local,
            media,
            events,
            config,
            service,
            executor,
            _dir: dir,
        }
    }

    fn start(&self) -> JoinHandle<()> {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.run().await.expect("executor failed");
        })
    }

    async fn stop(&self, handle: JoinHandle<()>) {
        self.executor.shutdown();
        handle.await.expect("executor task panicked");
    }

    async fn enqueue(&self) -> DownloadJob {
        self.service
            .enqueue(DownloadRequest::new(VIDEO_URL, CHANNEL))
            .await
            .expect("enqueue failed")
    }

    fn output_path(&self, id: &JobId, ext: &str) -> PathBuf {
        Path::new(&self.config.output_dir).join(format!("{}.{}", id, ext))
    }

    async fn wait_until<F>(&self, id: &JobId, what: &str, pred: F) -> DownloadJob
    where
        F: Fn(&DownloadJob) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.repo.require(id).await.expect("job vanished");
            if pred(&job) {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {}: {:?}",
                what,
                job
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_status(&self, id: &JobId, status: JobStatus) -> DownloadJob {
        self.wait_until(id, status.as_str(), |job| job.status == status)
            .await
    }
}

fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

fn assert_non_decreasing(events: &[ProgressEvent]) {
    let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {:?}",
        progress
    );
}

/// A valid request creates a queued job with zero progress.
#[tokio::test]
async fn test_enqueue_creates_queued_job() {
    let harness = Harness::build(
        FakeMedia::new(Step::Succeed),
        AdmissionConfig::default(),
        |_| {},
    );
    let mut rx = harness.local.subscribe(CHANNEL);

    let request = DownloadRequest::new(VIDEO_URL, CHANNEL).with_quality(AudioQuality::Highest);
    let job = harness.service.enqueue(request).await.expect("enqueue");

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert_eq!(job.quality, AudioQuality::Highest);
    assert_eq!(job.retry_count, 0);

    // Admission stagger of 2s plus up to 1s jitter
    let stagger = job.run_after - job.created_at;
    assert!(stagger >= chrono::Duration::seconds(2), "{:?}", stagger);
    assert!(stagger <= chrono::Duration::milliseconds(3100), "{:?}", stagger);

    let stored = harness.service.query(&job.id).await.expect("query");
    assert_eq!(stored.status, JobStatus::Queued);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, ProgressPhase::Queued);
    assert_eq!(events[0].job_id, job.id);
}

/// Malformed or unsupported requests are rejected before anything is stored.
#[tokio::test]
async fn test_enqueue_rejects_invalid_requests() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));

    for request in [
        DownloadRequest::new("not a url", CHANNEL),
        DownloadRequest::new("https://vimeo.com/123456", CHANNEL),
        DownloadRequest::new(VIDEO_URL, ""),
    ] {
        let err = harness.service.enqueue(request).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)), "{:?}", err);
    }

    assert_eq!(harness.service.stats().await.unwrap().waiting, 0);
}

/// The fifth active job is admitted, the sixth is not.
#[tokio::test]
async fn test_sixth_job_rejected_at_capacity() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));

    let mut admitted = Vec::new();
    for _ in 0..5 {
        admitted.push(harness.enqueue().await);
    }

    let err = harness
        .service
        .enqueue(DownloadRequest::new(VIDEO_URL, CHANNEL))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Capacity { active: 5, limit: 5 }));
    assert_eq!(harness.repo.count_active().await.unwrap(), 5);

    // Cancelling frees a slot
    harness.service.cancel(&admitted[0].id).await.unwrap();
    assert!(harness
        .service
        .enqueue(DownloadRequest::new(VIDEO_URL, CHANNEL))
        .await
        .is_ok());
}

/// Concurrent producers cannot overshoot the cap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueues_respect_cap() {
    let harness = Arc::new(Harness::new(FakeMedia::new(Step::Succeed)));

    let attempts = (0..8).map(|i| {
        let harness = harness.clone();
        async move {
            harness
                .service
                .enqueue(DownloadRequest::new(VIDEO_URL, format!("client-{}", i)))
                .await
        }
    });
    let results = futures::future::join_all(attempts).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(WorkerError::Capacity { .. })))
        .count();
    assert_eq!(accepted, 5);
    assert_eq!(rejected, 3);
    assert_eq!(harness.repo.count_active().await.unwrap(), 5);
}

/// A successful job ends at 100 with its media on disk and ordered events.
#[tokio::test]
async fn test_job_completes_with_monotone_progress() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));
    let mut rx = harness.local.subscribe(CHANNEL);
    let mut other = harness.local.subscribe("someone-else");
    let handle = harness.start();

    let job = harness.enqueue().await;
    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    harness.stop(handle).await;

    assert_eq!(done.progress, 100);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    let metadata = done.metadata.expect("metadata attached");
    assert_eq!(metadata.source_id, "dQw4w9WgXcQ");

    let output = harness.output_path(&job.id, "mp3");
    assert_eq!(tokio::fs::read(&output).await.unwrap(), vec![7u8; 16]);

    let events = drain(&mut rx);
    assert_non_decreasing(&events);
    assert!(events.iter().all(|e| e.job_id == job.id));
    assert!(events.iter().any(|e| e.phase == ProgressPhase::Downloading));
    assert!(events.iter().any(|e| e.phase == ProgressPhase::Converting));
    let last = events.last().expect("events");
    assert_eq!(last.phase, ProgressPhase::Completed);
    assert_eq!(last.progress, 100);

    // Nothing leaks to other channels
    assert!(drain(&mut other).is_empty());
}

/// Rate limiting on every attempt exhausts the budget and fails the job.
#[tokio::test]
async fn test_rate_limited_three_times_fails() {
    let harness = Harness::new(FakeMedia::new(Step::RateLimited));
    let mut rx = harness.local.subscribe(CHANNEL);
    let handle = harness.start();

    let job = harness.enqueue().await;
    let failed = harness.wait_for_status(&job.id, JobStatus::Failed).await;
    harness.stop(handle).await;

    assert_eq!(failed.retry_count, 3);
    assert!(!failed.can_retry());
    let error = failed.error.expect("error recorded");
    assert!(error.contains("429"), "{}", error);
    assert!(error.to_lowercase().contains("rate limit"), "{}", error);
    assert_eq!(harness.media.fetches(), 3);

    let events = drain(&mut rx);
    let retries = events
        .iter()
        .filter(|e| e.phase == ProgressPhase::Retrying)
        .count();
    assert_eq!(retries, 2);
    assert_eq!(events.last().unwrap().phase, ProgressPhase::Failed);
}

/// A transient failure followed by success completes on the second attempt.
#[tokio::test]
async fn test_transient_failure_then_success() {
    let harness =
        Harness::new(FakeMedia::new(Step::Succeed).scripted([Step::RateLimited]));
    let handle = harness.start();

    let job = harness.enqueue().await;
    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    harness.stop(handle).await;

    assert_eq!(done.retry_count, 1);
    assert!(done.error.is_none());
    assert_eq!(harness.media.fetches(), 2);
}

/// Terminal upstream errors are recorded without another attempt.
#[tokio::test]
async fn test_terminal_error_not_retried() {
    let harness = Harness::new(FakeMedia::new(Step::NotFound));
    let handle = harness.start();

    let job = harness.enqueue().await;
    let failed = harness.wait_for_status(&job.id, JobStatus::Failed).await;
    harness.stop(handle).await;

    assert_eq!(failed.retry_count, 1);
    assert!(failed.error.unwrap().contains("Video unavailable"));
    assert_eq!(harness.media.fetches(), 1);
}

/// A job cancelled while queued never reaches downloading.
#[tokio::test]
async fn test_cancel_queued_never_downloads() {
    let admission = AdmissionConfig {
        max_active: 5,
        base_delay: Duration::from_millis(300),
        max_jitter: Duration::ZERO,
    };
    let harness = Harness::build(FakeMedia::new(Step::Succeed), admission, |_| {});
    let handle = harness.start();

    let job = harness.enqueue().await;
    let cancelled = harness.service.cancel(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(600)).await;
    harness.stop(handle).await;

    let stored = harness.repo.require(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.started_at.is_none());
    assert_eq!(harness.media.fetches(), 0);

    // Terminal jobs reject further control
    let err = harness.service.cancel(&job.id).await.unwrap_err();
    assert!(matches!(err, WorkerError::Conflict(_)));
}

/// Pause parks the transfer, resume continues it to completion.
#[tokio::test]
async fn test_pause_and_resume_mid_download() {
    let media = FakeMedia::new(Step::Succeed).chunks(10, Duration::from_millis(30));
    let harness = Harness::new(media);
    let mut rx = harness.local.subscribe(CHANNEL);
    let handle = harness.start();

    let job = harness.enqueue().await;
    harness
        .wait_until(&job.id, "transfer under way", |j| {
            j.status == JobStatus::Downloading && j.progress >= 15
        })
        .await;

    let paused = harness.service.pause(&job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    // Let an in-flight chunk settle, then progress must stand still
    tokio::time::sleep(Duration::from_millis(150)).await;
    let before = harness.repo.require(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = harness.repo.require(&job.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Paused);
    assert_eq!(before.progress, after.progress);
    assert!(after.progress < 100);
    // The paused job keeps its slot
    assert!(harness.executor.available_slots() <= 1);

    let resumed = harness.service.resume(&job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Downloading);
    assert!(resumed.progress >= after.progress);

    let done = harness.wait_for_status(&job.id, JobStatus::Completed).await;
    harness.stop(handle).await;
    assert_eq!(done.progress, 100);
    assert_eq!(harness.media.fetches(), 1);

    let events = drain(&mut rx);
    assert_non_decreasing(&events);
    let phases: Vec<ProgressPhase> = events.iter().map(|e| e.phase).collect();
    let paused_at = phases
        .iter()
        .position(|p| *p == ProgressPhase::Paused)
        .expect("paused event");
    assert!(phases[paused_at..].contains(&ProgressPhase::Downloading));
    assert_eq!(*phases.last().unwrap(), ProgressPhase::Completed);
}

/// Cancelling a running job stops it and frees the slot for other work.
#[tokio::test]
async fn test_cancel_running_job_frees_slot() {
    let media = FakeMedia::new(Step::Succeed).chunks(40, Duration::from_millis(20));
    let harness = Harness::build(media, AdmissionConfig::immediate(5), |config| {
        config.max_concurrent_jobs = 1;
    });
    let handle = harness.start();

    let first = harness.enqueue().await;
    harness
        .wait_until(&first.id, "transfer under way", |j| j.progress > 5)
        .await;

    harness.service.cancel(&first.id).await.unwrap();

    let second = harness.enqueue().await;
    let started = harness
        .wait_until(&second.id, "second job started", |j| {
            j.status != JobStatus::Queued
        })
        .await;
    assert_ne!(started.status, JobStatus::Failed);

    harness.service.cancel(&second.id).await.unwrap();
    harness.stop(handle).await;

    let first = harness.repo.require(&first.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Cancelled);
    assert!(first.progress < 100);
    assert!(!harness.output_path(&first.id, "mp3").exists());
}

/// A panicking job is recorded as failed; siblings and the pool carry on.
#[tokio::test]
async fn test_panicking_job_is_isolated() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed).scripted([Step::Panic]));
    let handle = harness.start();

    let a = harness.enqueue().await;
    let b = harness.enqueue().await;

    let a = harness
        .wait_until(&a.id, "first job finished", |j| j.is_terminal())
        .await;
    let b = harness
        .wait_until(&b.id, "second job finished", |j| j.is_terminal())
        .await;

    let (failed, completed): (Vec<_>, Vec<_>) = [a, b]
        .into_iter()
        .partition(|j| j.status == JobStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, JobStatus::Completed);
    assert!(failed[0].error.as_deref().unwrap().contains("panicked"));

    // The pool still takes work
    let c = harness.enqueue().await;
    harness.wait_for_status(&c.id, JobStatus::Completed).await;
    harness.stop(handle).await;
}

/// An attempt that exceeds its deadline is retried, then failed.
#[tokio::test]
async fn test_attempt_timeout_is_retried() {
    let harness = Harness::build(
        FakeMedia::new(Step::Hang),
        AdmissionConfig::immediate(5),
        |config| config.attempt_timeout = Duration::from_millis(100),
    );
    let handle = harness.start();

    let job = harness.enqueue().await;
    let failed = harness.wait_for_status(&job.id, JobStatus::Failed).await;
    harness.stop(handle).await;

    assert_eq!(failed.retry_count, 3);
    assert!(failed.error.unwrap().contains("timed out"));
    assert_eq!(harness.media.fetches(), 3);
}

/// Paused jobs give up their slots at the attempt ceiling, so queued work still runs.
#[tokio::test]
async fn test_paused_jobs_release_slots_at_ceiling() {
    let media = FakeMedia::new(Step::Succeed).chunks(20, Duration::from_millis(30));
    let harness = Harness::build(media, AdmissionConfig::immediate(5), |config| {
        config.attempt_timeout = Duration::from_secs(1);
    });
    let handle = harness.start();

    let a = harness.enqueue().await;
    let b = harness.enqueue().await;
    for job in [&a, &b] {
        harness
            .wait_until(&job.id, "transfer under way", |j| {
                j.status == JobStatus::Downloading && j.progress > 5
            })
            .await;
        harness.service.pause(&job.id).await.unwrap();
    }
    assert_eq!(harness.executor.available_slots(), 0);

    let c = harness.enqueue().await;
    harness
        .wait_until(&a.id, "paused attempt timed out", |j| j.retry_count >= 1)
        .await;

    let c = harness.wait_for_status(&c.id, JobStatus::Completed).await;
    assert_eq!(c.retry_count, 0);

    // The timed-out jobs come back unpaused and finish too
    harness.wait_for_status(&a.id, JobStatus::Completed).await;
    harness.wait_for_status(&b.id, JobStatus::Completed).await;
    harness.stop(handle).await;
}

/// A reservation whose worker went silent is requeued and then completed by a live worker.
#[tokio::test]
async fn test_stalled_job_recovered_and_completed() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));

    let job = DownloadJob::new(
        VIDEO_URL,
        CHANNEL,
        Priority::Normal,
        AudioQuality::Highest,
        AudioFormat::Wav,
    );
    let id = harness.repo.add_job(job).await.unwrap();
    let ghost = harness.repo.reserve_next("ghost").await.unwrap().unwrap();
    let start = |j: &DownloadJob| j.start();
    harness
        .repo
        .modify(&id, Some(&ghost.lease), &start)
        .await
        .unwrap();

    let reaper = StallReaper::new(&harness.config, harness.repo.clone(), harness.events.clone());
    assert_eq!(reaper.reap_once().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    let recovered = harness.repo.require(&id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Queued);
    assert_eq!(recovered.retry_count, 1);

    // The ghost is fenced off
    assert!(harness.repo.heartbeat(&id, &ghost.lease).await.is_err());

    let handle = harness.start();
    let done = harness.wait_for_status(&id, JobStatus::Completed).await;
    harness.stop(handle).await;
    assert_eq!(done.retry_count, 1);
    assert!(harness.output_path(&id, "wav").exists());
}

/// Retention never evicts young jobs and does evict old ones.
#[tokio::test]
async fn test_cleanup_respects_thresholds() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));

    let finished = |status: JobStatus, age: chrono::Duration| {
        let job = DownloadJob::new(
            VIDEO_URL,
            CHANNEL,
            Priority::Normal,
            AudioQuality::Highest,
            AudioFormat::Mp3,
        )
        .start()
        .unwrap();
        let mut job = match status {
            JobStatus::Completed => job.complete().unwrap(),
            _ => job.fail("HTTP Error 404").unwrap(),
        };
        job.updated_at = job.updated_at - age;
        job
    };

    let old_done = harness
        .repo
        .add_job(finished(JobStatus::Completed, chrono::Duration::minutes(61)))
        .await
        .unwrap();
    let young_done = harness
        .repo
        .add_job(finished(JobStatus::Completed, chrono::Duration::minutes(59)))
        .await
        .unwrap();
    let old_failed = harness
        .repo
        .add_job(finished(JobStatus::Failed, chrono::Duration::hours(25)))
        .await
        .unwrap();
    let young_failed = harness
        .repo
        .add_job(finished(JobStatus::Failed, chrono::Duration::hours(23)))
        .await
        .unwrap();

    let report = harness.service.cleanup().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);

    assert!(harness.repo.get_job_by_id(&old_done).await.unwrap().is_none());
    assert!(harness.repo.get_job_by_id(&old_failed).await.unwrap().is_none());
    assert!(harness.repo.get_job_by_id(&young_done).await.unwrap().is_some());
    assert!(harness.repo.get_job_by_id(&young_failed).await.unwrap().is_some());
}

/// Control requests report unknown jobs and illegal transitions.
#[tokio::test]
async fn test_control_errors() {
    let harness = Harness::new(FakeMedia::new(Step::Succeed));

    let missing = JobId::from_string("missing");
    assert!(matches!(
        harness.service.pause(&missing).await,
        Err(WorkerError::NotFound(_))
    ));
    assert!(matches!(
        harness.service.query(&missing).await,
        Err(WorkerError::NotFound(_))
    ));

    let job = harness.enqueue().await;
    assert!(matches!(
        harness.service.pause(&job.id).await,
        Err(WorkerError::Conflict(_))
    ));
    assert!(matches!(
        harness.service.resume(&job.id).await,
        Err(WorkerError::Conflict(_))
    ));
    assert_eq!(
        harness.repo.require(&job.id).await.unwrap().status,
        JobStatus::Queued
    );
}
