//! Shared data models for the tubeq download engine.
//!
//! This crate provides Serde-serializable types for:
//! - The download job snapshot and its state machine
//! - Producer requests, status views and queue counters
//! - Progress event schemas

pub mod error;
pub mod event;
pub mod job;
pub mod request;

// Re-export common types
pub use error::{JobAction, TransitionError};
pub use event::{ProgressEvent, ProgressPhase};
pub use job::{
    AudioFormat, AudioQuality, DownloadJob, JobId, JobStatus, MediaMetadata, Priority, MAX_RETRIES,
    STALL_ERROR,
};
pub use request::{DownloadRequest, JobStatusView, QueueStats};
