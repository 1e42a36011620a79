//! Retry policies.
//!
//! Two layers retry independently:
//! - [`RetryPolicy`] decides whether a failed job attempt is requeued and
//!   how long it waits before it becomes eligible again.
//! - [`StoreRetry`] with [`retry_async`] retries a single repository write that hit a
//!   transient store error, so a Redis blip does not lose an outcome.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use tubeq_models::MAX_RETRIES;

use crate::config::{env_or, jitter};

/// Job-level retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts a job may accumulate, capped at [`MAX_RETRIES`].
    pub max_attempts: u32,
    /// Delay after the first failure; doubles with each further failure.
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            base_delay: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", MAX_RETRIES).clamp(1, MAX_RETRIES),
            base_delay: Duration::from_secs(env_or("RETRY_BASE_DELAY_SECS", 10)),
            max_jitter: Duration::from_millis(env_or("RETRY_JITTER_MS", 1000)),
        }
    }

    /// Zero delays, for tests and local runs.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Whether a job with `failed_attempts` failures may run again.
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts.min(MAX_RETRIES)
    }

    /// Deterministic part of the delay after the n-th failure: `base * 2^(n-1)`.
    pub fn base_backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Delay before the job becomes eligible again after the n-th failure.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.base_backoff(failed_attempts) + jitter(self.max_jitter)
    }
}

/// Bounded retry of one repository write.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    /// Label used in logs.
    pub what: &'static str,
    /// Retries after the first try.
    pub retries: u32,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl StoreRetry {
    pub const fn new(what: &'static str) -> Self {
        Self {
            what,
            retries: 3,
            first_delay: Duration::from_millis(100),
            delay_cap: Duration::from_secs(5),
        }
    }

    /// Sleep before retry number `n` (1-based).
    fn pause_before(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.delay_cap)
    }
}

/// Run `write`, retrying errors `transient` accepts until `retry.retries` is spent.
pub async fn retry_async<F, Fut, T, E, P>(retry: &StoreRetry, transient: P, write: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut n = 0;
    loop {
        let err = match write().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        n += 1;
        if n > retry.retries || !transient(&err) {
            return Err(err);
        }
        let pause = retry.pause_before(n);
        debug!(what = retry.what, retry = n, "Store write failed, retrying in {:?}: {}", pause, err);
        tokio::time::sleep(pause).await;
    }
}

/// Keeps a loop that fails every tick from flooding the log.
///
/// The first `loud` failures of a streak are reported, then the streak goes
/// quiet until a success resets it.
#[derive(Debug, Default)]
pub struct LogThrottle {
    streak: u32,
    loud: u32,
}

impl LogThrottle {
    pub fn new(loud: u32) -> Self {
        Self { streak: 0, loud }
    }

    pub fn ok(&mut self) {
        if self.streak > self.loud {
            debug!("Recovered after {} failures in a row", self.streak);
        }
        self.streak = 0;
    }

    /// Count a failure. `true` while it should still be logged.
    pub fn failed(&mut self) -> bool {
        self.streak = self.streak.saturating_add(1);
        if self.streak == self.loud + 1 {
            warn!("{} failures in a row, logging paused until recovery", self.streak);
        }
        self.streak <= self.loud
    }

    #[cfg(test)]
    fn streak(&self) -> u32 {
        self.streak
    }
}
