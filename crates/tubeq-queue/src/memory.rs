//! In-process queue repository.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tubeq_models::{DownloadJob, JobId, JobStatus, QueueStats};

use crate::error::{QueueError, QueueResult};
use crate::repository::{
    keeps_lease, require, CleanupReport, LeaseToken, QueueRepository, Reservation,
    RetentionPolicy, Transition,
};

#[derive(Debug, Clone)]
struct Entry {
    job: DownloadJob,
    lease: Option<LeaseToken>,
    heartbeat: Instant,
}

/// [`QueueRepository`] over a mutex-guarded map.
///
/// Holds the same guarantees as the Redis adapter within one process; every
/// operation runs under the lock, so compare-and-set never contends.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, terminal ones included.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl QueueRepository for MemoryQueue {
    async fn add_job(&self, job: DownloadJob) -> QueueResult<JobId> {
        let id = job.id.clone();
        let mut entries = self.entries.lock().await;
        entries.insert(
            id.clone(),
            Entry {
                job,
                lease: None,
                heartbeat: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn get_job_by_id(&self, id: &JobId) -> QueueResult<Option<DownloadJob>> {
        Ok(self.entries.lock().await.get(id).map(|e| e.job.clone()))
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> QueueResult<Vec<DownloadJob>> {
        let entries = self.entries.lock().await;
        let mut jobs: Vec<DownloadJob> = entries
            .values()
            .filter(|e| e.job.status == status)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn count_active(&self) -> QueueResult<usize> {
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|e| e.job.is_active()).count())
    }

    async fn get_queue_stats(&self) -> QueueResult<QueueStats> {
        let entries = self.entries.lock().await;
        let mut stats = QueueStats::default();
        for entry in entries.values() {
            stats.count(entry.job.status);
        }
        Ok(stats)
    }

    async fn cleanup_finished(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<CleanupReport> {
        let mut entries = self.entries.lock().await;
        let mut report = CleanupReport::default();

        for status in [JobStatus::Completed, JobStatus::Cancelled, JobStatus::Failed] {
            let (Some((_, batch)), Some(cutoff)) =
                (retention.rule(status), retention.cutoff(status, now))
            else {
                continue;
            };

            let mut expired: Vec<(DateTime<Utc>, JobId)> = entries
                .values()
                .filter(|e| e.job.status == status)
                .filter_map(|e| e.job.finished_at().map(|at| (at, e.job.id.clone())))
                .filter(|(at, _)| *at < cutoff)
                .collect();
            expired.sort();
            expired.truncate(batch);

            for (_, id) in &expired {
                entries.remove(id);
            }
            report.record(status, expired.len());
        }

        Ok(report)
    }

    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        let next = entries
            .values()
            .filter(|e| e.job.status == JobStatus::Queued && e.lease.is_none())
            .filter(|e| e.job.run_after <= now)
            .min_by_key(|e| (Reverse(e.job.priority), e.job.created_at))
            .map(|e| e.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(None);
        };

        let lease = LeaseToken::new();
        entry.lease = Some(lease.clone());
        entry.heartbeat = Instant::now();
        debug!(job_id = %id, worker = %worker, "Reserved job");

        Ok(Some(Reservation {
            job: entry.job.clone(),
            lease,
        }))
    }

    async fn modify(
        &self,
        id: &JobId,
        lease: Option<&LeaseToken>,
        transition: Transition<'_>,
    ) -> QueueResult<DownloadJob> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id).ok_or_else(|| QueueError::not_found(id))?;

        if let Some(lease) = lease {
            if entry.lease.as_ref() != Some(lease) {
                return Err(QueueError::lease_lost(id));
            }
        }

        let next = transition(&entry.job)?;
        if !keeps_lease(&next) {
            entry.lease = None;
        } else if !entry.job.status.is_reserved() {
            entry.heartbeat = Instant::now();
        }
        if next != entry.job {
            entry.job = next.clone();
        }
        Ok(next)
    }

    async fn heartbeat(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<DownloadJob> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id).ok_or_else(|| QueueError::not_found(id))?;
        if entry.lease.as_ref() != Some(lease) {
            return Err(QueueError::lease_lost(id));
        }
        entry.heartbeat = Instant::now();
        Ok(entry.job.clone())
    }

    async fn claim_stalled(
        &self,
        worker: &str,
        idle: Duration,
        limit: usize,
    ) -> QueueResult<Vec<Reservation>> {
        let mut entries = self.entries.lock().await;
        let mut stalled: Vec<&mut Entry> = entries
            .values_mut()
            .filter(|e| e.lease.is_some() && e.heartbeat.elapsed() > idle)
            .collect();
        stalled.sort_by_key(|e| e.heartbeat);

        let mut claimed = Vec::new();
        for entry in stalled.into_iter().take(limit) {
            let lease = LeaseToken::new();
            entry.lease = Some(lease.clone());
            entry.heartbeat = Instant::now();
            debug!(job_id = %entry.job.id, worker = %worker, "Claimed stalled job");
            claimed.push(Reservation {
                job: entry.job.clone(),
                lease,
            });
        }
        Ok(claimed)
    }

    async fn release(&self, id: &JobId, lease: &LeaseToken) -> QueueResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            if entry.lease.as_ref() == Some(lease) {
                entry.lease = None;
            }
        }
        Ok(())
    }
}

impl MemoryQueue {
    /// Current snapshot or `JobNotFound`.
    pub async fn require(&self, id: &JobId) -> QueueResult<DownloadJob> {
        require(id, self.get_job_by_id(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubeq_models::{AudioFormat, AudioQuality, Priority};

    fn job(priority: Priority) -> DownloadJob {
        DownloadJob::new(
            "https://youtu.be/dQw4w9WgXcQ",
            "client",
            priority,
            AudioQuality::Highest,
            AudioFormat::Mp3,
        )
    }

    async fn start(queue: &MemoryQueue) -> Reservation {
        let reservation = queue.reserve_next("w1").await.unwrap().unwrap();
        queue
            .modify(reservation.id(), Some(&reservation.lease), &|j: &DownloadJob| j.start())
            .await
            .unwrap();
        reservation
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let queue = MemoryQueue::new();
        let id = queue.add_job(job(Priority::Normal)).await.unwrap();

        let stored = queue.get_job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(queue
            .get_job_by_id(&JobId::from_string("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reserve_orders_by_priority_then_time() {
        let queue = MemoryQueue::new();
        let low = queue.add_job(job(Priority::Low)).await.unwrap();
        let normal_first = queue.add_job(job(Priority::Normal)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let normal_second = queue.add_job(job(Priority::Normal)).await.unwrap();
        let high = queue.add_job(job(Priority::High)).await.unwrap();

        let mut order = Vec::new();
        while let Some(r) = queue.reserve_next("w1").await.unwrap() {
            order.push(r.job.id);
        }
        assert_eq!(order, vec![high, normal_first, normal_second, low]);
    }

    #[tokio::test]
    async fn test_reservation_is_exclusive() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();

        assert!(queue.reserve_next("w1").await.unwrap().is_some());
        assert!(queue.reserve_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eligible_jobs_reserved_in_enqueue_order() {
        let queue = MemoryQueue::new();
        let now = Utc::now();

        // Enqueued first, but its start jitter made it eligible later
        let mut first = job(Priority::Normal);
        first.created_at = now - chrono::Duration::milliseconds(400);
        first.run_after = now - chrono::Duration::milliseconds(110);
        let mut second = job(Priority::Normal);
        second.created_at = now - chrono::Duration::milliseconds(380);
        second.run_after = now - chrono::Duration::milliseconds(170);

        let first_id = queue.add_job(first).await.unwrap();
        let second_id = queue.add_job(second).await.unwrap();

        assert_eq!(queue.reserve_next("w1").await.unwrap().unwrap().id(), &first_id);
        assert_eq!(queue.reserve_next("w1").await.unwrap().unwrap().id(), &second_id);
    }

    #[tokio::test]
    async fn test_delayed_job_not_reserved() {
        let queue = MemoryQueue::new();
        queue
            .add_job(job(Priority::High).scheduled_in(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(queue.reserve_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_fences_worker() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;

        queue.cancel_job(r.id()).await.unwrap();
        let err = queue.update_progress(r.id(), &r.lease, 50).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
        assert!(matches!(
            queue.heartbeat(r.id(), &r.lease).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_conflict_reported() {
        let queue = MemoryQueue::new();
        let id = queue.add_job(job(Priority::Normal)).await.unwrap();

        let err = queue.pause_job(&id).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
        assert_eq!(queue.require(&id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_status_is_idempotent() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;

        let first = queue
            .update_status(r.id(), Some(&r.lease), JobStatus::Downloading, None)
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Downloading);

        let done = queue
            .update_status(r.id(), Some(&r.lease), JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.progress, 100);

        let again = queue
            .update_status(r.id(), None, JobStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(again, done);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;

        queue.update_progress(r.id(), &r.lease, 60).await.unwrap();
        let job = queue.update_progress(r.id(), &r.lease, 20).await.unwrap();
        assert_eq!(job.progress, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_stalled() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(queue
            .claim_stalled("reaper", Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = queue
            .claim_stalled("reaper", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_ne!(claimed[0].lease, r.lease);

        // the original worker is fenced off
        assert!(matches!(
            queue.heartbeat(r.id(), &r.lease).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_release_makes_job_eligible() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = queue.reserve_next("w1").await.unwrap().unwrap();

        queue.release(r.id(), &r.lease).await.unwrap();
        assert!(queue.reserve_next("w2").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_leaves_claimed_job_alone() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let stale = start(&queue).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = queue
            .claim_stalled("reaper", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        queue.release(stale.id(), &stale.lease).await.unwrap();
        assert!(queue.reserve_next("w2").await.unwrap().is_none());
        assert!(queue.heartbeat(stale.id(), &claimed[0].lease).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_and_active_count() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;
        let paused = queue.pause_job(r.id()).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.paused, 1);
        assert_eq!(queue.count_active().await.unwrap(), 1);
        assert_eq!(queue.get_active_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_respects_thresholds() {
        let queue = MemoryQueue::new();
        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r = start(&queue).await;
        queue
            .update_status(r.id(), Some(&r.lease), JobStatus::Completed, None)
            .await
            .unwrap();

        queue.add_job(job(Priority::Normal)).await.unwrap();
        let r2 = start(&queue).await;
        queue
            .update_status(r2.id(), Some(&r2.lease), JobStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        let retention = RetentionPolicy::default();
        let now = Utc::now();

        let report = queue.cleanup_finished(&retention, now).await.unwrap();
        assert_eq!(report.total(), 0);

        let report = queue
            .cleanup_finished(&retention, now + chrono::Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        assert!(queue.get_job_by_id(r.id()).await.unwrap().is_none());

        let report = queue
            .cleanup_finished(&retention, now + chrono::Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_batch_bound() {
        let queue = MemoryQueue::new();
        let mut retention = RetentionPolicy::default();
        retention.completed_batch = 2;

        for _ in 0..3 {
            queue.add_job(job(Priority::Normal)).await.unwrap();
            let r = start(&queue).await;
            queue
                .update_status(r.id(), Some(&r.lease), JobStatus::Completed, None)
                .await
                .unwrap();
        }

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(queue.cleanup_finished(&retention, later).await.unwrap().completed, 2);
        assert_eq!(queue.cleanup_finished(&retention, later).await.unwrap().completed, 1);
    }
}
