//! Cooperative pause/cancel token for in-flight fetches.
//!
//! A [`FetchControl`] is shared between the worker that owns a job and the
//! fetch service doing the I/O. The service calls
//! [`FetchControl::checkpoint`] at every chunk boundary: it returns right
//! away while running, parks while paused and fails once cancelled. Pause and
//! cancel latency is therefore bounded by the chunk size, not instantaneous.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{FetchError, FetchResult};

/// Requested state of an in-flight fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Running,
    Paused,
    Cancelled,
}

/// Cloneable pause/cancel handle.
#[derive(Debug, Clone)]
pub struct FetchControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for FetchControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlSignal::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Current signal.
    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == ControlSignal::Cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.signal() == ControlSignal::Paused
    }

    /// Request a pause. Returns `false` if not running.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal != ControlSignal::Running {
                return false;
            }
            *signal = ControlSignal::Paused;
            true
        })
    }

    /// Lift a pause. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal != ControlSignal::Paused {
                return false;
            }
            *signal = ControlSignal::Running;
            true
        })
    }

    /// Cancel the fetch. Idempotent.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Cancelled {
                return false;
            }
            *signal = ControlSignal::Cancelled;
            true
        })
    }

    /// Chunk-boundary check.
    pub async fn checkpoint(&self) -> FetchResult<()> {
        let mut rx = self.tx.subscribe();
        loop {
            let signal = *rx.borrow_and_update();
            match signal {
                ControlSignal::Running => return Ok(()),
                ControlSignal::Cancelled => return Err(FetchError::Cancelled),
                ControlSignal::Paused => {
                    if rx.changed().await.is_err() {
                        return Err(FetchError::Cancelled);
                    }
                }
            }
        }
    }

    /// Resolves once the control is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() != ControlSignal::Cancelled {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
