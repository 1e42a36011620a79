//! Download worker.
//!
//! This crate provides:
//! - A bounded pool that reserves, runs and records download jobs
//! - Heartbeats, stall recovery and retention cleanup
//! - The producer-facing [`DownloadService`]
//! - Weighted progress forwarding and retry policy

pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod reaper;
pub mod retry;
pub mod service;

pub use config::{AdmissionConfig, ProgressWeights, WorkerConfig};
pub use control::JobControls;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use progress::ProgressTracker;
pub use reaper::{CleanupScheduler, StallReaper};
pub use retry::RetryPolicy;
pub use service::DownloadService;
