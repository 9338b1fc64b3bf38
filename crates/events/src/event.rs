//! Lifecycle event taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rebill_core::{Currency, CustomerId, SubscriptionId};

/// A dispatchable event.
///
/// Events are immutable facts; the `event_type` string is the stable,
/// dotted name handlers subscribe under (e.g. "subscription.renewed").
pub trait EventKind: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
}

/// Event: a renewal payment succeeded and the period advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRenewed {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub payment_id: String,
    pub amount: u64,
    pub currency: Currency,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Event: a renewal payment was declined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalFailed {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub reason: String,
}

/// Event: the subscription entered its dunning grace period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnteredGracePeriod {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub grace_period_started_at: DateTime<Utc>,
    pub grace_expires_at: DateTime<Utc>,
}

/// Event: a trial converted into a paid subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConverted {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub payment_id: String,
    pub amount: u64,
    pub currency: Currency,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Event: the trial-conversion charge was declined; the subscription is gone.
///
/// There is no dunning for trials: without an established payment
/// relationship the failure is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConversionFailed {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

/// Event: a dunning retry recovered the subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySucceeded {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub payment_id: String,
    pub retries_used: u32,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Event: a dunning retry was declined; the subscription stays past_due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryFailed {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub reason: String,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Event: the grace period expired with all retries exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanceledNonpayment {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub canceled_at: DateTime<Utc>,
    pub grace_period_started_at: Option<DateTime<Utc>>,
}

/// All events emitted by the lifecycle orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Renewed(SubscriptionRenewed),
    RenewalFailed(RenewalFailed),
    EnteredGracePeriod(EnteredGracePeriod),
    TrialConverted(TrialConverted),
    TrialConversionFailed(TrialConversionFailed),
    RetrySucceeded(RetrySucceeded),
    RetryFailed(RetryFailed),
    CanceledNonpayment(CanceledNonpayment),
}

impl LifecycleEvent {
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            LifecycleEvent::Renewed(e) => e.subscription_id,
            LifecycleEvent::RenewalFailed(e) => e.subscription_id,
            LifecycleEvent::EnteredGracePeriod(e) => e.subscription_id,
            LifecycleEvent::TrialConverted(e) => e.subscription_id,
            LifecycleEvent::TrialConversionFailed(e) => e.subscription_id,
            LifecycleEvent::RetrySucceeded(e) => e.subscription_id,
            LifecycleEvent::RetryFailed(e) => e.subscription_id,
            LifecycleEvent::CanceledNonpayment(e) => e.subscription_id,
        }
    }

    pub fn customer_id(&self) -> CustomerId {
        match self {
            LifecycleEvent::Renewed(e) => e.customer_id,
            LifecycleEvent::RenewalFailed(e) => e.customer_id,
            LifecycleEvent::EnteredGracePeriod(e) => e.customer_id,
            LifecycleEvent::TrialConverted(e) => e.customer_id,
            LifecycleEvent::TrialConversionFailed(e) => e.customer_id,
            LifecycleEvent::RetrySucceeded(e) => e.customer_id,
            LifecycleEvent::RetryFailed(e) => e.customer_id,
            LifecycleEvent::CanceledNonpayment(e) => e.customer_id,
        }
    }
}

impl EventKind for LifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::Renewed(_) => "subscription.renewed",
            LifecycleEvent::RenewalFailed(_) => "subscription.renewal_failed",
            LifecycleEvent::EnteredGracePeriod(_) => "subscription.entered_grace_period",
            LifecycleEvent::TrialConverted(_) => "subscription.trial_converted",
            LifecycleEvent::TrialConversionFailed(_) => "subscription.trial_conversion_failed",
            LifecycleEvent::RetrySucceeded(_) => "subscription.retry_succeeded",
            LifecycleEvent::RetryFailed(_) => "subscription.retry_failed",
            LifecycleEvent::CanceledNonpayment(_) => "subscription.canceled_nonpayment",
        }
    }
}
