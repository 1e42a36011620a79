//! Registry of pause/cancel handles for jobs running in this process.
//!
//! Producer requests handled in the same process reach the running fetch
//! immediately through this registry. Requests handled elsewhere arrive via
//! the heartbeat, which mirrors the stored status into the same handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tubeq_media::FetchControl;
use tubeq_models::{JobId, JobStatus};

#[derive(Debug, Clone, Default)]
pub struct JobControls {
    inner: Arc<Mutex<HashMap<JobId, FetchControl>>>,
}

impl JobControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, FetchControl>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a fresh handle for an attempt that is about to run.
    pub fn register(&self, id: &JobId) -> FetchControl {
        let control = FetchControl::new();
        self.lock().insert(id.clone(), control.clone());
        control
    }

    pub fn remove(&self, id: &JobId) {
        self.lock().remove(id);
    }

    pub fn get(&self, id: &JobId) -> Option<FetchControl> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Bring the local handle of `id` in line with its stored status.
    pub fn apply(&self, id: &JobId, status: JobStatus) {
        if let Some(control) = self.get(id) {
            mirror_status(&control, status);
        }
    }

    /// Cancel every running attempt. Stored statuses are left alone.
    pub fn cancel_all(&self) {
        for control in self.lock().values() {
            control.cancel();
        }
    }
}

/// Translate a stored status into a control signal.
pub fn mirror_status(control: &FetchControl, status: JobStatus) {
    match status {
        JobStatus::Paused => {
            control.pause();
        }
        JobStatus::Downloading => {
            control.resume();
        }
        JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed => {
            control.cancel();
        }
        JobStatus::Queued => {}
    }
}
