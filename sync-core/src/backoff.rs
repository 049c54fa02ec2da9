//! Poll delay computation.
//!
//! The delay is a pure function of the failure count: the scheduler in
//! `sync-client` only stores `fail_count` and adds the result to `now`.

use std::time::Duration;

/// Default interval between polls of a healthy link (60 seconds).
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(60);

/// Default base of the exponential retry delay (500 ms).
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Default cap on the exponent.
pub const DEFAULT_MAX_POWER: u32 = 10;

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after a success, and the upper bound of every failure delay.
    pub base_interval: Duration,
    /// Base of the failure delay.
    pub retry_base: Duration,
    /// Largest exponent applied to `retry_base`.
    pub max_power: u32,
}

impl BackoffPolicy {
    /// Create a policy from explicit parameters.
    pub fn new(base_interval: Duration, retry_base: Duration, max_power: u32) -> Self {
        Self {
            base_interval,
            retry_base,
            max_power,
        }
    }

    /// Delay used after a success (or when a due poll is consumed).
    pub fn success_delay(&self) -> Duration {
        self.base_interval
    }

    /// Delay after `fail_count` consecutive failures:
    /// `min(retry_base + retry_base * 2^min(fail_count, max_power), base_interval)`.
    pub fn failure_delay(&self, fail_count: u32) -> Duration {
        let power = fail_count.min(self.max_power).min(31);
        let factor = 1u32 << power;
        let grown = self
            .retry_base
            .checked_mul(factor)
            .and_then(|d| d.checked_add(self.retry_base))
            .unwrap_or(Duration::MAX);
        grown.min(self.base_interval)
    }

    /// Delay for the current failure count (zero means healthy).
    pub fn delay(&self, fail_count: u32) -> Duration {
        if fail_count == 0 {
            self.success_delay()
        } else {
            self.failure_delay(fail_count)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_INTERVAL, DEFAULT_RETRY_BASE, DEFAULT_MAX_POWER)
    }
}
