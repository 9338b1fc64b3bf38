//! Retry delay computation.
//!
//! One pure function plus the policy struct that carries its parameters. The
//! job scheduler uses it to space out re-attempts; the optimistic-concurrency
//! wrapper uses it to space out conflict retries. Dunning retries do **not**
//! use it: their cadence is a fixed day-granularity business policy
//! (`retry_intervals`), not a transient-fault policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Compute the delay before `attempt` (1-indexed: attempt 1 waits `base_delay`).
///
/// Exponential: `base_delay * 2^(attempt - 1)`, capped at `max_delay`. When
/// `jitter_ratio > 0` the capped delay is multiplied by a uniform random
/// factor in `[1 - jitter_ratio, 1 + jitter_ratio]`.
pub fn delay_for_attempt(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base_delay.as_millis() as f64;
    let max_ms = max_delay.as_millis() as f64;

    let exp = 2_f64.powi((attempt - 1).min(i32::MAX as u32) as i32);
    let mut delay_ms = (base_ms * exp).min(max_ms);

    if jitter_ratio > 0.0 {
        let factor = rand::thread_rng().gen_range(1.0 - jitter_ratio..=1.0 + jitter_ratio);
        delay_ms *= factor;
    }

    Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first execution (0 = no retries).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Jitter ratio (0.0-1.0) applied as a uniform factor around the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries at all.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Policy that re-queues immediately (no backoff between attempts).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Policy for optimistic-lock conflicts: 3 retries, 100 ms base, 1 s cap.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
        }
    }

    /// Delay before the given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        delay_for_attempt(attempt, self.base_delay, self.max_delay, self.jitter)
    }

    /// Check if more retries are allowed after `attempt` completed executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
