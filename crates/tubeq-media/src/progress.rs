//! Raw progress reporting from a fetch.

use tokio::sync::mpsc;

/// Progress reported by a fetch service. Phase weighting happens downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FetchProgress {
    /// Bytes moved so far; `total_bytes` is unknown for some streams.
    Transfer {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// Conversion fraction in `[0, 1]`.
    Converting { fraction: f64 },
}

impl FetchProgress {
    /// Completed fraction of the current phase, clamped to `[0, 1]`.
    pub fn fraction(&self) -> Option<f64> {
        match *self {
            FetchProgress::Transfer {
                downloaded_bytes,
                total_bytes: Some(total),
            } if total > 0 => Some((downloaded_bytes as f64 / total as f64).clamp(0.0, 1.0)),
            FetchProgress::Transfer { .. } => None,
            FetchProgress::Converting { fraction } => Some(fraction.clamp(0.0, 1.0)),
        }
    }
}

/// Non-blocking progress sender handed to a fetch.
///
/// Uses a bounded channel so the I/O path never waits on consumers.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<FetchProgress>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<FetchProgress>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FetchProgress>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Send a progress update (non-blocking).
    pub fn report(&self, progress: FetchProgress) {
        // Drop the update when the consumer lags
        let _ = self.tx.try_send(progress);
    }

    pub fn transfer(&self, downloaded_bytes: u64, total_bytes: Option<u64>) {
        self.report(FetchProgress::Transfer {
            downloaded_bytes,
            total_bytes,
        });
    }

    pub fn converting(&self, fraction: f64) {
        self.report(FetchProgress::Converting { fraction });
    }
}
