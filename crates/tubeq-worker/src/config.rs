//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use tubeq_queue::RetentionPolicy;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};
use crate::retry::RetryPolicy;

/// Parse an environment variable, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name recorded on reservations made by this process
    pub worker_name: String,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Hard ceiling for one fetch+convert attempt, excluding time spent paused
    pub attempt_timeout: Duration,
    /// Interval for refreshing job ownership while processing
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a reservation is presumed crashed
    pub stall_timeout: Duration,
    /// How often to scan for stalled reservations
    pub claim_interval: Duration,
    /// How often to evict old finished jobs
    pub cleanup_interval: Duration,
    /// Idle wait between reservation attempts when the queue is empty
    pub poll_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: String,
    /// Where completed media is written
    pub output_dir: String,
    pub retry: RetryPolicy,
    pub progress: ProgressWeights,
    pub retention: RetentionPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            max_concurrent_jobs: 2,
            attempt_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(120),
            claim_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(60),
            work_dir: "/tmp/tubeq".to_string(),
            output_dir: "/tmp/tubeq/output".to_string(),
            retry: RetryPolicy::default(),
            progress: ProgressWeights::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

fn default_worker_name() -> String {
    format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8])
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();
        let progress = match std::env::var("PROGRESS_WEIGHTS") {
            Ok(raw) => raw.parse()?,
            Err(_) => ProgressWeights::default(),
        };

        let config = Self {
            worker_name: std::env::var("WORKER_NAME").unwrap_or(defaults.worker_name),
            max_concurrent_jobs: env_or("WORKER_MAX_JOBS", defaults.max_concurrent_jobs),
            attempt_timeout: Duration::from_secs(env_or("WORKER_ATTEMPT_TIMEOUT_SECS", 300)),
            heartbeat_interval: Duration::from_secs(env_or("WORKER_HEARTBEAT_SECS", 10)),
            stall_timeout: Duration::from_secs(env_or("WORKER_STALL_TIMEOUT_SECS", 120)),
            claim_interval: Duration::from_secs(env_or("WORKER_CLAIM_INTERVAL_SECS", 30)),
            cleanup_interval: Duration::from_secs(env_or("WORKER_CLEANUP_INTERVAL_SECS", 600)),
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_MS", 500)),
            shutdown_timeout: Duration::from_secs(env_or("WORKER_SHUTDOWN_TIMEOUT", 60)),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            output_dir: std::env::var("WORKER_OUTPUT_DIR").unwrap_or(defaults.output_dir),
            retry: RetryPolicy::from_env(),
            progress,
            retention: defaults.retention,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(WorkerError::config("WORKER_MAX_JOBS must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() || self.attempt_timeout.is_zero() {
            return Err(WorkerError::config(
                "heartbeat interval and attempt timeout must be positive",
            ));
        }
        if self.stall_timeout <= self.heartbeat_interval {
            return Err(WorkerError::config(format!(
                "stall timeout ({:?}) must exceed the heartbeat interval ({:?})",
                self.stall_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

/// Global admission cap and start stagger applied at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Queued plus downloading jobs allowed at once
    pub max_active: usize,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active: 5,
            base_delay: Duration::from_secs(2),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl AdmissionConfig {
    pub fn from_env() -> Self {
        Self {
            max_active: env_or("ADMISSION_MAX_ACTIVE", 5),
            base_delay: Duration::from_millis(env_or("ADMISSION_BASE_DELAY_MS", 2000)),
            max_jitter: Duration::from_millis(env_or("ADMISSION_JITTER_MS", 1000)),
        }
    }

    /// No stagger; jobs are eligible as soon as they are stored.
    pub fn immediate(max_active: usize) -> Self {
        Self {
            max_active,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before a newly accepted job may be reserved.
    pub fn start_delay(&self) -> Duration {
        self.base_delay + jitter(self.max_jitter)
    }
}

/// Uniform jitter in `[0, max]`.
pub(crate) fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Share of the 0-100 progress range given to each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressWeights {
    pub metadata: u8,
    pub transfer: u8,
    pub conversion: u8,
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            metadata: 5,
            transfer: 80,
            conversion: 15,
        }
    }
}

impl ProgressWeights {
    pub fn new(metadata: u8, transfer: u8, conversion: u8) -> WorkerResult<Self> {
        let weights = Self {
            metadata,
            transfer,
            conversion,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        let total = self.metadata as u32 + self.transfer as u32 + self.conversion as u32;
        if total != 100 {
            return Err(WorkerError::config(format!(
                "progress weights must sum to 100, got {}",
                total
            )));
        }
        if self.transfer <= self.metadata || self.transfer <= self.conversion {
            return Err(WorkerError::config(
                "transfer must carry the largest progress weight",
            ));
        }
        Ok(())
    }
}

impl FromStr for ProgressWeights {
    type Err = WorkerError;

    /// Parses `"metadata,transfer,conversion"`, e.g. `"5,80,15"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u8> = s
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<_, _>>()
            .map_err(|e| WorkerError::config(format!("invalid PROGRESS_WEIGHTS {:?}: {}", s, e)))?;

        match parts.as_slice() {
            [metadata, transfer, conversion] => Self::new(*metadata, *transfer, *conversion),
            _ => Err(WorkerError::config(format!(
                "PROGRESS_WEIGHTS needs three values, got {:?}",
                s
            ))),
        }
    }
}
