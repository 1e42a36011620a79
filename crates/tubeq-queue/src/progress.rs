//! Progress events via Redis Pub/Sub.
//!
//! Delivery is best-effort and not replayed. A subscriber that joins late
//! reads the authoritative snapshot from the repository.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use tubeq_models::{DownloadJob, ProgressEvent, ProgressPhase};

use crate::error::QueueResult;

/// Per-channel buffer of the in-process broadcaster.
const LOCAL_CHANNEL_CAPACITY: usize = 64;

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Fan-out of progress events to subscriber channels.
#[async_trait]
pub trait ProgressBroadcaster: Send + Sync {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> QueueResult<()>;
}

/// Redis Pub/Sub broadcaster.
pub struct RedisBroadcaster {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisBroadcaster {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
        })
    }

    /// Redis channel for a client channel.
    pub fn channel_name(&self, channel: &str) -> String {
        format!("{}:progress:{}", self.prefix, channel)
    }

    /// Subscribe to progress events for a client channel.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(&self, channel: &str) -> QueueResult<ProgressStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name(channel)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ProgressBroadcaster for RedisBroadcaster {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let name = self.channel_name(channel);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", name);
        conn.publish::<_, _, ()>(name, payload).await?;
        Ok(())
    }
}

/// In-process broadcaster over `tokio::sync::broadcast`.
#[derive(Default)]
pub struct LocalBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<ProgressEvent> {
        self.sender(channel).subscribe()
    }
}

#[async_trait]
impl ProgressBroadcaster for LocalBroadcaster {
    async fn publish(&self, channel: &str, event: &ProgressEvent) -> QueueResult<()> {
        // No subscribers is not an error
        let _ = self.sender(channel).send(event.clone());
        Ok(())
    }
}

/// Publishes job events to the channel recorded on the job.
#[derive(Clone)]
pub struct JobEvents {
    broadcaster: Arc<dyn ProgressBroadcaster>,
}

impl JobEvents {
    pub fn new(broadcaster: Arc<dyn ProgressBroadcaster>) -> Self {
        Self { broadcaster }
    }

    /// Publish the snapshot. Failures are logged, never returned.
    pub async fn emit(&self, job: &DownloadJob, phase: ProgressPhase) {
        self.send(job, ProgressEvent::for_job(job, phase)).await;
    }

    pub async fn emit_with_message(
        &self,
        job: &DownloadJob,
        phase: ProgressPhase,
        message: impl Into<String>,
    ) {
        let event = ProgressEvent::for_job(job, phase).with_message(message);
        self.send(job, event).await;
    }

    /// Publish with the phase implied by the job status.
    pub async fn emit_status(&self, job: &DownloadJob) {
        self.emit(job, ProgressPhase::for_status(job.status)).await;
    }

    async fn send(&self, job: &DownloadJob, event: ProgressEvent) {
        if let Err(e) = self.broadcaster.publish(&job.client_channel, &event).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish progress event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubeq_models::{AudioFormat, AudioQuality, JobStatus, Priority};

    fn job(channel: &str) -> DownloadJob {
        DownloadJob::new(
            "https://youtu.be/dQw4w9WgXcQ",
            channel,
            Priority::Normal,
            AudioQuality::Highest,
            AudioFormat::Mp3,
        )
    }

    #[tokio::test]
    async fn test_events_reach_only_recorded_channel() {
        let local = Arc::new(LocalBroadcaster::new());
        let mut mine = local.subscribe("client-a");
        let mut other = local.subscribe("client-b");
        let events = JobEvents::new(local.clone());

        let job = job("client-a");
        events.emit(&job, ProgressPhase::Queued).await;

        let event = mine.recv().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.status, JobStatus::Queued);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let local = LocalBroadcaster::new();
        let job = job("nobody");
        let event = ProgressEvent::for_job(&job, ProgressPhase::Queued);
        assert!(local.publish("nobody", &event).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_job_order_preserved() {
        let local = Arc::new(LocalBroadcaster::new());
        let mut rx = local.subscribe("c");
        let events = JobEvents::new(local.clone());

        let mut job = job("c").start().unwrap();
        for p in [10u8, 40, 90] {
            job = job.with_progress(p).unwrap();
            events.emit(&job, ProgressPhase::Downloading).await;
        }

        let seen: Vec<u8> = vec![
            rx.recv().await.unwrap().progress,
            rx.recv().await.unwrap().progress,
            rx.recv().await.unwrap().progress,
        ];
        assert_eq!(seen, vec![10, 40, 90]);
    }
}
