//! The subscription lifecycle orchestrator.
//!
//! Four idempotent sweeps plus [`process_all`](LifecycleOrchestrator::process_all):
//!
//! - **renewals** and **trial conversions** create new debt (a fresh charge);
//! - **retries** and **cancellations** work off existing debt (dunning).
//!
//! Keeping them as independent sweeps means each can run on its own cadence
//! and be tested in isolation. Every sweep is selection + per-item pipeline:
//! re-read the record, resolve its price, materialize an invoice, charge,
//! apply one version-checked patch, emit events. The per-item pipeline runs
//! inside [`with_conflict_retry`]: losing an optimistic-concurrency race
//! causes a re-read, which typically shows the record already advanced and
//! turns the item into a no-op.
//!
//! A sweep never throws for an individual record. Declines are state
//! transitions, unresolvable prices are logged skips, and store/gateway
//! failures are counted as failed items; only a failing candidate query
//! aborts the sweep and propagates to the external scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use rebill_core::{
    Currency, Price, Subscription, SubscriptionFilter, SubscriptionId, SubscriptionPatch,
    SubscriptionStatus, with_conflict_retry,
};
use rebill_events::{
    CanceledNonpayment, EnteredGracePeriod, EventDispatcher, LifecycleEvent, RenewalFailed,
    RetryFailed, RetrySucceeded, SubscriptionRenewed, TrialConversionFailed, TrialConverted,
};

use crate::config::BillingConfig;
use crate::ports::{
    BillingStore, ChargeType, GatewayError, InvoiceInput, PaymentGateway, PaymentMetadata,
    PaymentOutcome, PaymentRequest, StoreError,
};

/// Per-sweep result counts.
///
/// `processed` covers items that went through a charge/transition;
/// `skipped` tracks no-ops (unresolvable price, record advanced by a
/// concurrent sweep, not actually due on re-read) separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl SweepSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => {
                self.processed += 1;
                self.succeeded += 1;
            }
            ItemOutcome::Failed => {
                self.processed += 1;
                self.failed += 1;
            }
            ItemOutcome::Skipped => {
                self.skipped += 1;
            }
        }
    }

    fn record_error(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

/// Composite result of [`LifecycleOrchestrator::process_all`], keyed by
/// operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub renewals: SweepSummary,
    pub trial_conversions: SweepSummary,
    pub retries: SweepSummary,
    pub cancellations: SweepSummary,
}

/// A sweep-level failure (the candidate query itself).
#[derive(Debug, Error, Clone)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Error, Clone)]
enum ItemError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ItemError {
    fn is_conflict(&self) -> bool {
        matches!(self, ItemError::Store(e) if e.is_conflict())
    }
}

/// Drives subscriptions through renewal, trial conversion, dunning and
/// cancellation.
///
/// Holds no subscription state between invocations; every operation re-reads
/// the current record before acting on it.
pub struct LifecycleOrchestrator<S, G> {
    store: S,
    gateway: G,
    dispatcher: Arc<EventDispatcher<LifecycleEvent>>,
    config: BillingConfig,
}

impl<S, G> LifecycleOrchestrator<S, G>
where
    S: BillingStore,
    G: PaymentGateway,
{
    pub fn new(
        store: S,
        gateway: G,
        dispatcher: Arc<EventDispatcher<LifecycleEvent>>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<LifecycleEvent>> {
        &self.dispatcher
    }

    /// Charge every active subscription whose period has ended and advance it
    /// one billing interval; declines move it into the grace period.
    pub fn process_renewals(&self, now: DateTime<Utc>) -> Result<SweepSummary, SweepError> {
        let filter =
            SubscriptionFilter::with_status(SubscriptionStatus::Active).period_end_until(now);
        let candidates = self.store.list_subscriptions(&filter)?;

        let summary = self.sweep("renewals", candidates, |id| self.renew_one(id, now));
        Ok(summary)
    }

    /// Convert ended trials into paid subscriptions. A declined conversion is
    /// terminal: no payment relationship exists yet, so there is no dunning.
    pub fn process_trial_conversions(&self, now: DateTime<Utc>) -> Result<SweepSummary, SweepError> {
        let filter = SubscriptionFilter::with_status(SubscriptionStatus::Trialing);
        let candidates = self.store.list_subscriptions(&filter)?;

        let summary = self.sweep("trial_conversions", candidates, |id| {
            self.convert_one(id, now)
        });
        Ok(summary)
    }

    /// Re-attempt payment for past-due subscriptions whose next dunning slot
    /// has arrived.
    pub fn process_retries(&self, now: DateTime<Utc>) -> Result<SweepSummary, SweepError> {
        let filter = SubscriptionFilter::with_status(SubscriptionStatus::PastDue);
        let candidates = self.store.list_subscriptions(&filter)?;

        let summary = self.sweep("retries", candidates, |id| self.retry_one(id, now));
        Ok(summary)
    }

    /// Cancel past-due subscriptions whose grace period has run out. Never
    /// attempts a payment.
    pub fn process_cancellations(&self, now: DateTime<Utc>) -> Result<SweepSummary, SweepError> {
        let filter = SubscriptionFilter::with_status(SubscriptionStatus::PastDue);
        let candidates = self.store.list_subscriptions(&filter)?;

        let summary = self.sweep("cancellations", candidates, |id| self.cancel_one(id, now));
        Ok(summary)
    }

    /// Run all four sweeps in a fixed order: renewals, trial conversions,
    /// retries, cancellations.
    ///
    /// The order matters: a subscription freshly marked past_due by this
    /// tick's renewal sweep starts its grace period now, and so is not also
    /// swept away by this tick's cancellation pass.
    pub fn process_all(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        Ok(SweepReport {
            renewals: self.process_renewals(now)?,
            trial_conversions: self.process_trial_conversions(now)?,
            retries: self.process_retries(now)?,
            cancellations: self.process_cancellations(now)?,
        })
    }

    fn sweep(
        &self,
        name: &'static str,
        candidates: Vec<Subscription>,
        run_one: impl Fn(SubscriptionId) -> Result<ItemOutcome, ItemError>,
    ) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for candidate in &candidates {
            let outcome = with_conflict_retry(
                &self.config.conflict_retry,
                ItemError::is_conflict,
                || run_one(candidate.id),
            );
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    // One bad record never blocks the batch.
                    error!(sweep = name, subscription_id = %candidate.id, error = %e, "sweep item errored");
                    summary.record_error();
                }
            }
        }

        info!(
            sweep = name,
            candidates = candidates.len(),
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "sweep finished"
        );
        summary
    }

    fn renew_one(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<ItemOutcome, ItemError> {
        let Some(sub) = self.store.get_subscription(id)? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !sub.renewal_due(now) {
            debug!(subscription_id = %id, "renewal no longer due, skipping");
            return Ok(ItemOutcome::Skipped);
        }
        let Some(price) = self.resolve_price(&sub)? else {
            warn!(subscription_id = %id, plan_id = %sub.plan_id, "no active price for plan, skipping renewal");
            return Ok(ItemOutcome::Skipped);
        };
        let amount = price.amount_for(sub.quantity).map_err(StoreError::from)?;

        match self.charge(&sub, amount, &price.currency, ChargeType::Renewal, now)? {
            PaymentOutcome::Approved { payment_id } => {
                let period_start = sub.current_period_end;
                let period_end = sub.interval.advance(period_start, sub.interval_count);
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    current_period_start: Some(period_start),
                    current_period_end: Some(period_end),
                    ..Default::default()
                };
                self.store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                info!(subscription_id = %id, %period_end, "subscription renewed");
                self.dispatcher
                    .emit(LifecycleEvent::Renewed(SubscriptionRenewed {
                        subscription_id: sub.id,
                        customer_id: sub.customer_id,
                        payment_id,
                        amount,
                        currency: price.currency.clone(),
                        period_start,
                        period_end,
                    }));
                Ok(ItemOutcome::Succeeded)
            }
            PaymentOutcome::Declined { reason } => {
                let entering_grace = sub.dunning.grace_period_started_at.is_none();
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::PastDue),
                    grace_period_started_at: entering_grace.then_some(now),
                    ..Default::default()
                };
                self.store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                warn!(subscription_id = %id, reason = %reason, "renewal payment declined");
                self.dispatcher
                    .emit(LifecycleEvent::RenewalFailed(RenewalFailed {
                        subscription_id: sub.id,
                        customer_id: sub.customer_id,
                        reason,
                    }));
                if entering_grace {
                    self.dispatcher
                        .emit(LifecycleEvent::EnteredGracePeriod(EnteredGracePeriod {
                            subscription_id: sub.id,
                            customer_id: sub.customer_id,
                            grace_period_started_at: now,
                            grace_expires_at: self.config.grace_deadline(now),
                        }));
                }
                Ok(ItemOutcome::Failed)
            }
        }
    }

    fn convert_one(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<ItemOutcome, ItemError> {
        let Some(sub) = self.store.get_subscription(id)? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !sub.trial_conversion_due(now, self.config.trial_conversion_days) {
            return Ok(ItemOutcome::Skipped);
        }
        let Some(price) = self.resolve_price(&sub)? else {
            warn!(subscription_id = %id, plan_id = %sub.plan_id, "no active price for plan, skipping trial conversion");
            return Ok(ItemOutcome::Skipped);
        };
        let amount = price.amount_for(sub.quantity).map_err(StoreError::from)?;

        match self.charge(&sub, amount, &price.currency, ChargeType::TrialConversion, now)? {
            PaymentOutcome::Approved { payment_id } => {
                let period_end = sub.interval.advance(now, sub.interval_count);
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    current_period_start: Some(now),
                    current_period_end: Some(period_end),
                    ..Default::default()
                };
                self.store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                info!(subscription_id = %id, "trial converted");
                self.dispatcher
                    .emit(LifecycleEvent::TrialConverted(TrialConverted {
                        subscription_id: sub.id,
                        customer_id: sub.customer_id,
                        payment_id,
                        amount,
                        currency: price.currency.clone(),
                        period_start: now,
                        period_end,
                    }));
                Ok(ItemOutcome::Succeeded)
            }
            PaymentOutcome::Declined { reason } => {
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::Canceled),
                    canceled_at: Some(now),
                    ..Default::default()
                };
                self.store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                warn!(subscription_id = %id, reason = %reason, "trial conversion declined, subscription canceled");
                self.dispatcher.emit(LifecycleEvent::TrialConversionFailed(
                    TrialConversionFailed {
                        subscription_id: sub.id,
                        customer_id: sub.customer_id,
                        reason,
                        canceled_at: now,
                    },
                ));
                Ok(ItemOutcome::Failed)
            }
        }
    }

    fn retry_one(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<ItemOutcome, ItemError> {
        let Some(sub) = self.store.get_subscription(id)? else {
            return Ok(ItemOutcome::Skipped);
        };
        match sub.next_retry_due(&self.config.retry_intervals) {
            Some(due) if due <= now => {}
            _ => return Ok(ItemOutcome::Skipped),
        }
        let Some(price) = self.resolve_price(&sub)? else {
            warn!(subscription_id = %id, plan_id = %sub.plan_id, "no active price for plan, skipping retry");
            return Ok(ItemOutcome::Skipped);
        };
        let amount = price.amount_for(sub.quantity).map_err(StoreError::from)?;

        match self.charge(&sub, amount, &price.currency, ChargeType::Retry, now)? {
            PaymentOutcome::Approved { payment_id } => {
                // Recovery opens a fresh period anchored at the recovery
                // time; the customer does not pay again for the time spent
                // past_due.
                let period_end = sub.interval.advance(now, sub.interval_count);
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    current_period_start: Some(now),
                    current_period_end: Some(period_end),
                    ..Default::default()
                };
                self.store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                info!(subscription_id = %id, retries_used = sub.dunning.retry_count + 1, "dunning retry recovered subscription");
                self.dispatcher
                    .emit(LifecycleEvent::RetrySucceeded(RetrySucceeded {
                        subscription_id: sub.id,
                        customer_id: sub.customer_id,
                        payment_id,
                        retries_used: sub.dunning.retry_count + 1,
                        period_start: now,
                        period_end,
                    }));
                Ok(ItemOutcome::Succeeded)
            }
            PaymentOutcome::Declined { reason } => {
                let retry_count = sub.dunning.retry_count + 1;
                let patch = SubscriptionPatch {
                    retry_count: Some(retry_count),
                    last_retry_at: Some(now),
                    ..Default::default()
                };
                let updated = self
                    .store
                    .update_subscription(sub.id, &patch, sub.version, now)?;

                let next_retry_at = updated.next_retry_due(&self.config.retry_intervals);
                warn!(subscription_id = %id, retry_count, reason = %reason, "dunning retry declined");
                self.dispatcher.emit(LifecycleEvent::RetryFailed(RetryFailed {
                    subscription_id: sub.id,
                    customer_id: sub.customer_id,
                    reason,
                    retry_count,
                    next_retry_at,
                }));
                Ok(ItemOutcome::Failed)
            }
        }
    }

    fn cancel_one(&self, id: SubscriptionId, now: DateTime<Utc>) -> Result<ItemOutcome, ItemError> {
        let Some(sub) = self.store.get_subscription(id)? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !sub.grace_expired(now, self.config.grace_period_days) {
            return Ok(ItemOutcome::Skipped);
        }

        let grace_period_started_at = sub.dunning.grace_period_started_at;
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Canceled),
            canceled_at: Some(now),
            ..Default::default()
        };
        self.store
            .update_subscription(sub.id, &patch, sub.version, now)?;

        info!(subscription_id = %id, "subscription canceled for nonpayment");
        self.dispatcher
            .emit(LifecycleEvent::CanceledNonpayment(CanceledNonpayment {
                subscription_id: sub.id,
                customer_id: sub.customer_id,
                canceled_at: now,
                grace_period_started_at,
            }));
        Ok(ItemOutcome::Succeeded)
    }

    /// The active price for the subscription's plan, preferring an exact
    /// interval match.
    fn resolve_price(&self, sub: &Subscription) -> Result<Option<Price>, ItemError> {
        let prices = self.store.prices_for_plan(sub.plan_id)?;
        let exact = prices.iter().find(|p| {
            p.active && p.interval == sub.interval && p.interval_count == sub.interval_count
        });
        let fallback = prices.iter().find(|p| p.active);
        Ok(exact.or(fallback).cloned())
    }

    /// Materialize the billable line, then run the charge.
    ///
    /// A customer without a default payment method is a decline, not an
    /// error: it is the canonical dunning trigger.
    fn charge(
        &self,
        sub: &Subscription,
        amount: u64,
        currency: &Currency,
        charge_type: ChargeType,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome, ItemError> {
        self.store.create_invoice(
            InvoiceInput {
                subscription_id: sub.id,
                customer_id: sub.customer_id,
                amount,
                currency: currency.clone(),
                charge_type,
            },
            now,
        )?;

        if self
            .gateway
            .default_payment_method(sub.customer_id)?
            .is_none()
        {
            return Ok(PaymentOutcome::Declined {
                reason: "no default payment method".to_string(),
            });
        }

        let request = PaymentRequest {
            customer_id: sub.customer_id,
            amount,
            currency: currency.clone(),
            metadata: PaymentMetadata {
                subscription_id: sub.id,
                charge_type,
            },
        };
        Ok(self.gateway.process_payment(&request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use rebill_core::{BillingInterval, CustomerId, PaymentProvider, PlanId};

    use crate::memory::InMemoryBillingStore;
    use crate::ports::PaymentMethod;

    /// Scripted gateway: pops pre-seeded outcomes, records every request.
    struct MockGateway {
        outcomes: Mutex<VecDeque<PaymentOutcome>>,
        requests: Mutex<Vec<PaymentRequest>>,
        has_payment_method: bool,
    }

    impl MockGateway {
        fn approving() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                has_payment_method: true,
            }
        }

        fn scripted(outcomes: Vec<PaymentOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::new(Vec::new()),
                has_payment_method: true,
            }
        }

        fn without_payment_method() -> Self {
            Self {
                has_payment_method: false,
                ..Self::approving()
            }
        }

        fn declining(reason: &str) -> Self {
            Self::scripted(vec![PaymentOutcome::Declined {
                reason: reason.to_string(),
            }])
        }

        fn requests(&self) -> Vec<PaymentRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl PaymentGateway for MockGateway {
        fn provider(&self) -> PaymentProvider {
            PaymentProvider::Stripe
        }

        fn process_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentOutcome, GatewayError> {
            self.requests.lock().unwrap().push(request.clone());
            let scripted = self.outcomes.lock().unwrap().pop_front();
            Ok(scripted.unwrap_or(PaymentOutcome::Approved {
                payment_id: format!("pay_{}", self.requests.lock().unwrap().len()),
            }))
        }

        fn default_payment_method(
            &self,
            _customer_id: CustomerId,
        ) -> Result<Option<PaymentMethod>, GatewayError> {
            Ok(self.has_payment_method.then(|| PaymentMethod {
                id: "pm_1".to_string(),
                provider_payment_method_id: "card_1".to_string(),
            }))
        }
    }

    type TestOrchestrator = LifecycleOrchestrator<Arc<InMemoryBillingStore>, Arc<MockGateway>>;

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        gateway: Arc<MockGateway>,
        orchestrator: TestOrchestrator,
        events: Arc<Mutex<Vec<LifecycleEvent>>>,
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn harness(gateway: MockGateway, config: BillingConfig) -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(gateway);
        let dispatcher = Arc::new(EventDispatcher::<LifecycleEvent>::new(config.livemode));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dispatcher.on_any(move |envelope| {
            sink.lock().unwrap().push(envelope.payload().clone());
            Ok(())
        });

        let orchestrator = LifecycleOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            dispatcher,
            config,
        );
        Harness {
            store,
            gateway,
            orchestrator,
            events,
        }
    }

    impl Harness {
        fn event_types(&self) -> Vec<&'static str> {
            use rebill_events::EventKind;
            self.events.lock().unwrap().iter().map(|e| e.event_type()).collect()
        }

        fn seed_active_due(&self, now: DateTime<Utc>) -> Subscription {
            let plan_id = PlanId::new();
            self.store.add_price(Price::new(
                plan_id,
                Currency::new("usd").unwrap(),
                2500,
                BillingInterval::Month,
                1,
                now,
            ));
            // Period ended a day ago.
            let mut sub = Subscription::new(
                CustomerId::new(),
                plan_id,
                BillingInterval::Month,
                1,
                now - Duration::days(32),
            );
            sub.current_period_end = now - Duration::days(1);
            self.store.insert_subscription(sub.clone()).unwrap();
            sub
        }

        fn seed_past_due(
            &self,
            now: DateTime<Utc>,
            grace_started: DateTime<Utc>,
            retry_count: u32,
            last_retry_at: Option<DateTime<Utc>>,
        ) -> Subscription {
            let sub = self.seed_active_due(now);
            let current = self.store.get_subscription(sub.id).unwrap().unwrap();
            let patch = SubscriptionPatch {
                status: Some(SubscriptionStatus::PastDue),
                grace_period_started_at: Some(grace_started),
                retry_count: (retry_count > 0).then_some(retry_count),
                last_retry_at,
                ..Default::default()
            };
            self.store
                .update_subscription(sub.id, &patch, current.version, grace_started)
                .unwrap()
        }
    }

    #[test]
    fn renewal_success_advances_the_period() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());
        let sub = h.seed_active_due(now);
        let old_period_end = sub.current_period_end;

        let summary = h.orchestrator.process_renewals(now).unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                processed: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0
            }
        );

        let renewed = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert_eq!(renewed.current_period_start, old_period_end);
        assert_eq!(
            renewed.current_period_end,
            BillingInterval::Month.advance(old_period_end, 1)
        );

        let requests = h.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, 2500);
        assert_eq!(requests[0].metadata.charge_type, ChargeType::Renewal);
        assert_eq!(requests[0].metadata.subscription_id, sub.id);
        assert_eq!(h.event_types(), vec!["subscription.renewed"]);

        // An invoice was materialized before the charge.
        assert_eq!(h.store.invoices().len(), 1);
    }

    #[test]
    fn renewal_decline_starts_the_grace_period_once() {
        let now = test_time();
        let h = harness(MockGateway::declining("Card declined"), BillingConfig::default());
        let sub = h.seed_active_due(now);

        let summary = h.orchestrator.process_renewals(now).unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                processed: 1,
                succeeded: 0,
                failed: 1,
                skipped: 0
            }
        );

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(stored.dunning.grace_period_started_at, Some(now));
        assert_eq!(stored.dunning.retry_count, 0);

        // Decline, then grace-period entry, in that order.
        assert_eq!(
            h.event_types(),
            vec![
                "subscription.renewal_failed",
                "subscription.entered_grace_period"
            ]
        );
    }

    #[test]
    fn unresolvable_price_is_a_logged_skip() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());

        // Due subscription with no price on its plan.
        let mut sub = Subscription::new(
            CustomerId::new(),
            PlanId::new(),
            BillingInterval::Month,
            1,
            now - Duration::days(32),
        );
        sub.current_period_end = now - Duration::days(1);
        h.store.insert_subscription(sub).unwrap();

        let summary = h.orchestrator.process_renewals(now).unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                processed: 0,
                succeeded: 0,
                failed: 0,
                skipped: 1
            }
        );
        assert!(h.gateway.requests().is_empty());
        assert!(h.event_types().is_empty());
    }

    #[test]
    fn missing_payment_method_is_a_decline_not_an_error() {
        let now = test_time();
        let h = harness(MockGateway::without_payment_method(), BillingConfig::default());
        let sub = h.seed_active_due(now);

        let summary = h.orchestrator.process_renewals(now).unwrap();
        assert_eq!(summary.failed, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        // The charge never reached the provider.
        assert!(h.gateway.requests().is_empty());
    }

    #[test]
    fn trial_conversion_success_activates() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());

        let plan_id = PlanId::new();
        h.store.add_price(Price::new(
            plan_id,
            Currency::new("usd").unwrap(),
            900,
            BillingInterval::Month,
            1,
            now,
        ));
        let sub = Subscription::new(
            CustomerId::new(),
            plan_id,
            BillingInterval::Month,
            1,
            now - Duration::days(15),
        )
        .with_trial(now - Duration::days(15), Some(now - Duration::hours(1)));
        h.store.insert_subscription(sub.clone()).unwrap();

        let summary = h.orchestrator.process_trial_conversions(now).unwrap();
        assert_eq!(summary.succeeded, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.current_period_start, now);

        let requests = h.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metadata.charge_type, ChargeType::TrialConversion);
        assert_eq!(h.event_types(), vec!["subscription.trial_converted"]);
    }

    #[test]
    fn trial_conversion_decline_is_terminal() {
        let now = test_time();
        let h = harness(MockGateway::declining("Card declined"), BillingConfig::default());

        let plan_id = PlanId::new();
        h.store.add_price(Price::new(
            plan_id,
            Currency::new("usd").unwrap(),
            900,
            BillingInterval::Month,
            1,
            now,
        ));
        let sub = Subscription::new(
            CustomerId::new(),
            plan_id,
            BillingInterval::Month,
            1,
            now - Duration::days(15),
        )
        .with_trial(now - Duration::days(15), Some(now - Duration::hours(1)));
        h.store.insert_subscription(sub.clone()).unwrap();

        let summary = h.orchestrator.process_trial_conversions(now).unwrap();
        assert_eq!(summary.failed, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert_eq!(stored.canceled_at, Some(now));
        assert_eq!(h.event_types(), vec!["subscription.trial_conversion_failed"]);

        // No dunning follows a failed conversion.
        let retries = h.orchestrator.process_retries(now + Duration::days(2)).unwrap();
        assert_eq!(retries, SweepSummary::default());
        assert_eq!(h.gateway.requests().len(), 1);
    }

    #[test]
    fn trials_without_an_end_use_the_configured_fallback() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());

        let plan_id = PlanId::new();
        h.store.add_price(Price::new(
            plan_id,
            Currency::new("usd").unwrap(),
            900,
            BillingInterval::Month,
            1,
            now,
        ));
        // trial_start 10 days ago, no trial_end; with a 14-day fallback the
        // conversion is not due yet.
        let sub = Subscription::new(CustomerId::new(), plan_id, BillingInterval::Month, 1, now)
            .with_trial(now - Duration::days(10), None);
        h.store.insert_subscription(sub.clone()).unwrap();

        let summary = h.orchestrator.process_trial_conversions(now).unwrap();
        assert_eq!(summary.skipped, 1);

        let later = now + Duration::days(5);
        let summary = h.orchestrator.process_trial_conversions(later).unwrap();
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn retry_success_recovers_the_subscription() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());
        // Grace started 2 days ago, no retry yet: first slot (1 day) has passed.
        let sub = h.seed_past_due(now, now - Duration::days(2), 0, None);

        let summary = h.orchestrator.process_retries(now).unwrap();
        assert_eq!(summary.succeeded, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.dunning, Default::default());
        assert_eq!(stored.current_period_start, now);

        let requests = h.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metadata.charge_type, ChargeType::Retry);
        assert_eq!(h.event_types(), vec!["subscription.retry_succeeded"]);
    }

    #[test]
    fn retry_decline_advances_the_dunning_counter() {
        let now = test_time();
        let h = harness(MockGateway::declining("Card declined"), BillingConfig::default());
        let sub = h.seed_past_due(now, now - Duration::days(2), 0, None);

        let summary = h.orchestrator.process_retries(now).unwrap();
        assert_eq!(summary.failed, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(stored.dunning.retry_count, 1);
        assert_eq!(stored.dunning.last_retry_at, Some(now));
        assert_eq!(h.event_types(), vec!["subscription.retry_failed"]);
    }

    #[test]
    fn retries_wait_for_their_slot_and_stop_when_exhausted() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());

        // Not yet due: grace started an hour ago, first slot is at +1 day.
        h.seed_past_due(now, now - Duration::hours(1), 0, None);
        let summary = h.orchestrator.process_retries(now).unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(h.gateway.requests().is_empty());

        // Exhausted: retry_count equals the schedule length.
        let h = harness(MockGateway::approving(), BillingConfig::default());
        h.seed_past_due(now, now - Duration::days(12), 3, Some(now - Duration::days(3)));
        let summary = h.orchestrator.process_retries(now).unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(h.gateway.requests().is_empty());
    }

    #[test]
    fn cancellation_sweeps_expired_grace_periods_without_charging() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());
        let grace_started = now - Duration::days(15);
        let sub = h.seed_past_due(now, grace_started, 3, Some(now - Duration::days(6)));

        let summary = h.orchestrator.process_cancellations(now).unwrap();
        assert_eq!(summary.succeeded, 1);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert_eq!(stored.canceled_at, Some(now));

        assert!(h.gateway.requests().is_empty());
        assert_eq!(h.event_types(), vec!["subscription.canceled_nonpayment"]);
    }

    #[test]
    fn unexpired_grace_periods_are_left_alone() {
        let now = test_time();
        let h = harness(MockGateway::approving(), BillingConfig::default());
        h.seed_past_due(now, now - Duration::days(3), 1, Some(now - Duration::days(2)));

        let summary = h.orchestrator.process_cancellations(now).unwrap();
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn process_all_returns_all_four_summaries_even_when_empty() {
        let h = harness(MockGateway::approving(), BillingConfig::default());
        let report = h.orchestrator.process_all(test_time()).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn a_fresh_grace_period_survives_the_same_tick() {
        let now = test_time();
        // Even with a zero-day grace period, a renewal declined in this tick
        // must not be cancelled by this tick's cancellation pass.
        let config = BillingConfig {
            grace_period_days: 0,
            ..BillingConfig::default()
        };
        let h = harness(MockGateway::declining("Card declined"), config);
        let sub = h.seed_active_due(now);

        let report = h.orchestrator.process_all(now).unwrap();
        assert_eq!(report.renewals.failed, 1);
        assert_eq!(report.cancellations.processed, 0);

        let stored = h.store.get_subscription(sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }

    /// Store wrapper whose first update loses an optimistic race.
    struct FirstUpdateConflicts<S> {
        inner: S,
        conflicted: Mutex<bool>,
    }

    impl<S: BillingStore> BillingStore for FirstUpdateConflicts<S> {
        fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
            self.inner.insert_subscription(subscription)
        }

        fn get_subscription(
            &self,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>, StoreError> {
            self.inner.get_subscription(id)
        }

        fn list_subscriptions(
            &self,
            filter: &SubscriptionFilter,
        ) -> Result<Vec<Subscription>, StoreError> {
            self.inner.list_subscriptions(filter)
        }

        fn update_subscription(
            &self,
            id: SubscriptionId,
            patch: &SubscriptionPatch,
            expected_version: rebill_core::VersionToken,
            now: DateTime<Utc>,
        ) -> Result<Subscription, StoreError> {
            let mut conflicted = self.conflicted.lock().unwrap();
            if !*conflicted {
                *conflicted = true;
                return Err(StoreError::OptimisticLock(
                    rebill_core::OptimisticLockError::new("subscription", id.to_string()),
                ));
            }
            self.inner.update_subscription(id, patch, expected_version, now)
        }

        fn prices_for_plan(&self, plan_id: PlanId) -> Result<Vec<Price>, StoreError> {
            self.inner.prices_for_plan(plan_id)
        }

        fn create_invoice(
            &self,
            input: InvoiceInput,
            now: DateTime<Utc>,
        ) -> Result<Invoice, StoreError> {
            self.inner.create_invoice(input, now)
        }
    }

    use crate::ports::Invoice;

    #[test]
    fn a_lost_race_re_reads_and_completes_on_retry() {
        let now = test_time();
        let inner = InMemoryBillingStore::new();
        let gateway = Arc::new(MockGateway::approving());
        let dispatcher = Arc::new(EventDispatcher::new(false));

        let plan_id = PlanId::new();
        inner.add_price(Price::new(
            plan_id,
            Currency::new("usd").unwrap(),
            2500,
            BillingInterval::Month,
            1,
            now,
        ));
        let mut sub = Subscription::new(
            CustomerId::new(),
            plan_id,
            BillingInterval::Month,
            1,
            now - Duration::days(32),
        );
        sub.current_period_end = now - Duration::days(1);
        let sub_id = sub.id;
        inner.insert_subscription(sub).unwrap();

        let mut config = BillingConfig::default();
        config.conflict_retry = rebill_core::RetryPolicy {
            base_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            ..rebill_core::RetryPolicy::conflict()
        };
        let store = Arc::new(FirstUpdateConflicts {
            inner,
            conflicted: Mutex::new(false),
        });
        let orchestrator = LifecycleOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            dispatcher,
            config,
        );

        let summary = orchestrator.process_renewals(now).unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);

        let stored = store.get_subscription(sub_id).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        // The whole read-charge-write pipeline re-ran after the lost race.
        assert_eq!(gateway.requests().len(), 2);
    }
}
