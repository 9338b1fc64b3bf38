//! Billing configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use rebill_core::RetryPolicy;

/// Configuration for the lifecycle orchestrator.
///
/// Constructed once and passed into the orchestrator; there is no ambient
/// global billing state anywhere in this workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Days a subscription may stay `past_due` before cancellation.
    pub grace_period_days: u32,

    /// Dunning cadence: day offsets between retry attempts, indexed by retry
    /// count. The schedule length is also the retry budget.
    pub retry_intervals: Vec<u32>,

    /// Default trial length, used when a trialing subscription carries a
    /// `trial_start` but no explicit `trial_end`.
    pub trial_conversion_days: u32,

    /// Stamped onto every emitted event envelope.
    pub livemode: bool,

    /// Retry policy for optimistic-lock conflicts during sweeps.
    #[serde(default = "RetryPolicy::conflict")]
    pub conflict_retry: RetryPolicy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 14,
            retry_intervals: vec![1, 3, 5],
            trial_conversion_days: 14,
            livemode: false,
            conflict_retry: RetryPolicy::conflict(),
        }
    }
}

impl BillingConfig {
    /// When a grace period that started at `started_at` runs out.
    pub fn grace_deadline(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        started_at + Duration::days(i64::from(self.grace_period_days))
    }
}
