//! Weighted progress mapping and forwarding.
//!
//! A fetch reports raw transfer and conversion fractions. They are mapped
//! onto the job's 0-100 range by [`ProgressWeights`], persisted with the
//! attempt's lease and then published. Values only ever move up; 100 is
//! reserved for the completion transition.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use tubeq_media::FetchProgress;
use tubeq_models::{JobId, ProgressPhase};
use tubeq_queue::{JobEvents, LeaseToken, QueueError, QueueRepository};

use crate::config::ProgressWeights;

/// Highest value reported before the job completes.
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Monotone mapping from raw fetch progress to job progress.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    weights: ProgressWeights,
    last: u8,
}

impl ProgressTracker {
    pub fn new(weights: ProgressWeights) -> Self {
        Self { weights, last: 0 }
    }

    /// Start from the value already stored on the job.
    pub fn resume_from(mut self, progress: u8) -> Self {
        self.last = progress.min(MAX_RUNNING_PROGRESS);
        self
    }

    /// Progress once metadata has been fetched.
    pub fn metadata_done(&mut self) -> u8 {
        self.last = self.last.max(self.weights.metadata);
        self.last
    }

    /// Value for `progress` regardless of what was reported before.
    pub fn map(&self, progress: &FetchProgress) -> Option<(u8, ProgressPhase)> {
        let fraction = progress.fraction()?;
        let (offset, weight, phase) = match progress {
            FetchProgress::Transfer { .. } => (
                self.weights.metadata,
                self.weights.transfer,
                ProgressPhase::Downloading,
            ),
            FetchProgress::Converting { .. } => (
                self.weights.metadata + self.weights.transfer,
                self.weights.conversion,
                ProgressPhase::Converting,
            ),
        };
        let value = offset as f64 + (weight as f64 * fraction).round();
        Some(((value as u8).min(MAX_RUNNING_PROGRESS), phase))
    }

    /// Mapped value if it moves progress forward.
    pub fn advance(&mut self, progress: &FetchProgress) -> Option<(u8, ProgressPhase)> {
        let (value, phase) = self.map(progress)?;
        if value <= self.last {
            return None;
        }
        self.last = value;
        Some((value, phase))
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}

/// Drain raw progress for one attempt into the repository and subscribers.
///
/// Returns when the sender side closes or the lease is lost.
pub async fn forward_progress(
    repo: Arc<dyn QueueRepository>,
    events: JobEvents,
    id: JobId,
    lease: LeaseToken,
    mut tracker: ProgressTracker,
    mut rx: mpsc::Receiver<FetchProgress>,
) -> u8 {
    while let Some(raw) = rx.recv().await {
        let Some((value, phase)) = tracker.advance(&raw) else {
            continue;
        };

        match repo.update_progress(&id, &lease, value).await {
            Ok(job) => events.emit(&job, phase).await,
            Err(QueueError::LeaseLost(_)) | Err(QueueError::JobNotFound(_)) => {
                debug!(job_id = %id, "Progress forwarding stopped, reservation gone");
                break;
            }
            Err(e) => warn!(job_id = %id, error = %e, "Failed to record progress"),
        }
    }
    tracker.last()
}
