//! Job repository and progress broadcasting.
//!
//! This crate provides:
//! - The [`QueueRepository`] contract with leases and compare-and-set writes
//! - A Redis implementation driven by Lua scripts
//! - An in-process implementation with the same guarantees
//! - Progress events via Redis Pub/Sub or in-process channels

pub mod error;
pub mod job;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod repository;

pub use error::{QueueError, QueueResult};
pub use job::JobPayload;
pub use memory::MemoryQueue;
pub use progress::{JobEvents, LocalBroadcaster, ProgressBroadcaster, ProgressStream, RedisBroadcaster};
pub use queue::{QueueBackend, QueueConfig, RedisQueue};
pub use repository::{
    CleanupReport, LeaseToken, QueueRepository, Reservation, RetentionPolicy, Transition,
};
