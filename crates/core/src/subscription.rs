//! Subscription entity and its lifecycle state machine.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::id::{CustomerId, PlanId, SubscriptionId};
use crate::provider::PaymentProvider;
use crate::version::VersionToken;

/// Billing cadence unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    /// Add `count` units of this interval to `from`.
    ///
    /// Month/year arithmetic clamps to the end of the target month
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(self, from: DateTime<Utc>, count: u32) -> DateTime<Utc> {
        match self {
            BillingInterval::Day => from + Duration::days(i64::from(count)),
            BillingInterval::Week => from + Duration::weeks(i64::from(count)),
            BillingInterval::Month => from.checked_add_months(Months::new(count)).unwrap_or(from),
            BillingInterval::Year => from
                .checked_add_months(Months::new(count.saturating_mul(12)))
                .unwrap_or(from),
        }
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Lifecycle transition table. Any edge not listed here is rejected.
    ///
    /// ```text
    /// trialing -> active      trial conversion succeeds
    /// trialing -> canceled    trial conversion fails
    /// active   -> active      renewal succeeds, period advances
    /// active   -> past_due    renewal fails, grace period starts
    /// past_due -> active      retry succeeds
    /// past_due -> canceled    grace period expires
    /// any      -> canceled    explicit cancellation
    /// ```
    pub fn can_transition_to(self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, to) {
            (Canceled, _) => false,
            (_, Canceled) => true,
            (Trialing, Active) => true,
            (Active, Active) => true,
            (Active, PastDue) => true,
            (PastDue, Active) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Dunning sub-state, only meaningful while the subscription is `past_due`.
///
/// `retry_count` is non-decreasing within one grace period; the whole state
/// resets whenever the subscription leaves `past_due`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DunningState {
    pub grace_period_started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// The unit the lifecycle orchestrator mutates.
///
/// All writes go through a store's version-checked update; `version` changes
/// on every successful write and is the only concurrency-control state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub customer_id: CustomerId,
    pub plan_id: PlanId,

    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub quantity: u32,

    /// Half-open billing period; renewal is due once `now >= current_period_end`.
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,

    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,

    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,

    pub dunning: DunningState,

    /// External subscription ids, one per provider the record is mirrored to.
    #[serde(default)]
    pub provider_subscription_ids: HashMap<PaymentProvider, String>,

    /// Provider passthrough fields with no fixed schema. Lifecycle state never
    /// lives here.
    #[serde(default)]
    pub metadata: serde_json::Value,

    pub version: VersionToken,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create an active subscription whose first period starts at `now`.
    pub fn new(
        customer_id: CustomerId,
        plan_id: PlanId,
        interval: BillingInterval,
        interval_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            customer_id,
            plan_id,
            status: SubscriptionStatus::Active,
            interval,
            interval_count,
            quantity: 1,
            current_period_start: now,
            current_period_end: interval.advance(now, interval_count),
            trial_start: None,
            trial_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            dunning: DunningState::default(),
            provider_subscription_ids: HashMap::new(),
            metadata: serde_json::Value::Null,
            version: VersionToken::new(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Start the subscription in a trial instead of an active period.
    pub fn with_trial(mut self, trial_start: DateTime<Utc>, trial_end: Option<DateTime<Utc>>) -> Self {
        self.status = SubscriptionStatus::Trialing;
        self.trial_start = Some(trial_start);
        self.trial_end = trial_end;
        self
    }

    pub fn with_provider_ref(mut self, provider: PaymentProvider, external_id: impl Into<String>) -> Self {
        self.provider_subscription_ids.insert(provider, external_id.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Renewal is due once the current period has ended.
    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && !self.is_deleted()
            && self.current_period_end <= now
    }

    /// Trial end, falling back to `trial_start + fallback_days` when the
    /// record carries no explicit end.
    pub fn effective_trial_end(&self, fallback_days: u32) -> Option<DateTime<Utc>> {
        self.trial_end
            .or_else(|| self.trial_start.map(|s| s + Duration::days(i64::from(fallback_days))))
    }

    pub fn trial_conversion_due(&self, now: DateTime<Utc>, fallback_days: u32) -> bool {
        self.status == SubscriptionStatus::Trialing
            && !self.is_deleted()
            && self
                .effective_trial_end(fallback_days)
                .is_some_and(|end| end <= now)
    }

    /// When the next dunning retry becomes due, if one is still allowed.
    ///
    /// `retry_intervals` holds day offsets indexed by retry count; the next
    /// attempt is anchored at the last retry, or at the start of the grace
    /// period when none has run yet.
    pub fn next_retry_due(&self, retry_intervals: &[u32]) -> Option<DateTime<Utc>> {
        if self.status != SubscriptionStatus::PastDue || self.is_deleted() {
            return None;
        }
        let interval_days = *retry_intervals.get(self.dunning.retry_count as usize)?;
        let anchor = self
            .dunning
            .last_retry_at
            .or(self.dunning.grace_period_started_at)?;
        Some(anchor + Duration::days(i64::from(interval_days)))
    }

    /// Whether the grace period has run out.
    pub fn grace_expired(&self, now: DateTime<Utc>, grace_period_days: u32) -> bool {
        self.status == SubscriptionStatus::PastDue
            && !self.is_deleted()
            && self
                .dunning
                .grace_period_started_at
                .is_some_and(|started| now - started > Duration::days(i64::from(grace_period_days)))
    }

    /// Apply a version-checked write's patch.
    ///
    /// Enforces the transition table and the dunning invariants, then rotates
    /// the version token. Stores call this under their own write lock after
    /// comparing the expected token.
    pub fn apply_patch(&mut self, patch: &SubscriptionPatch, now: DateTime<Utc>) -> BillingResult<()> {
        let was_past_due = self.status == SubscriptionStatus::PastDue;

        if let Some(to) = patch.status {
            if !self.status.can_transition_to(to) {
                return Err(BillingError::InvalidTransition {
                    from: self.status,
                    to,
                });
            }
        }

        let target_status = patch.status.unwrap_or(self.status);
        if target_status == SubscriptionStatus::PastDue {
            if let Some(count) = patch.retry_count {
                if was_past_due && count < self.dunning.retry_count {
                    return Err(BillingError::invariant(format!(
                        "retry_count may not decrease while past_due ({} -> {count})",
                        self.dunning.retry_count
                    )));
                }
            }
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(start) = patch.current_period_start {
            self.current_period_start = start;
        }
        if let Some(end) = patch.current_period_end {
            self.current_period_end = end;
        }
        if let Some(cancel_at) = patch.cancel_at {
            self.cancel_at = Some(cancel_at);
        }
        if let Some(canceled_at) = patch.canceled_at {
            self.canceled_at = Some(canceled_at);
        }
        if let Some(flag) = patch.cancel_at_period_end {
            self.cancel_at_period_end = flag;
        }
        if let Some(started) = patch.grace_period_started_at {
            self.dunning.grace_period_started_at = Some(started);
        }
        if let Some(count) = patch.retry_count {
            self.dunning.retry_count = count;
        }
        if let Some(at) = patch.last_retry_at {
            self.dunning.last_retry_at = Some(at);
        }
        if let Some(deleted_at) = patch.deleted_at {
            self.deleted_at = Some(deleted_at);
        }

        // Dunning state is scoped to past_due; leaving the state resets it.
        if was_past_due && self.status != SubscriptionStatus::PastDue {
            self.dunning = DunningState::default();
        }

        self.updated_at = now;
        self.version = VersionToken::new();
        Ok(())
    }
}

/// Partial update applied through a version-checked write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub grace_period_started_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Selection predicate for listing subscriptions.
///
/// Soft-deleted records are excluded unless `include_deleted` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub status: Option<SubscriptionStatus>,
    /// Matches records whose `current_period_end` is at or before this instant.
    pub period_end_until: Option<DateTime<Utc>>,
    /// Matches records whose `trial_end` is at or before this instant.
    pub trial_end_until: Option<DateTime<Utc>>,
    pub customer_id: Option<CustomerId>,
    pub include_deleted: bool,
}

impl SubscriptionFilter {
    pub fn with_status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn period_end_until(mut self, until: DateTime<Utc>) -> Self {
        self.period_end_until = Some(until);
        self
    }

    pub fn trial_end_until(mut self, until: DateTime<Utc>) -> Self {
        self.trial_end_until = Some(until);
        self
    }

    pub fn matches(&self, subscription: &Subscription) -> bool {
        if subscription.is_deleted() && !self.include_deleted {
            return false;
        }
        if let Some(status) = self.status {
            if subscription.status != status {
                return false;
            }
        }
        if let Some(until) = self.period_end_until {
            if subscription.current_period_end > until {
                return false;
            }
        }
        if let Some(until) = self.trial_end_until {
            match subscription.trial_end {
                Some(end) if end <= until => {}
                _ => return false,
            }
        }
        if let Some(customer_id) = self.customer_id {
            if subscription.customer_id != customer_id {
                return false;
            }
        }
        true
    }
}
