//! End-to-end dunning flows driven through the public API: a declined
//! renewal enters the grace period, retries run on their day schedule, and
//! the subscription either recovers or is canceled for nonpayment.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};

use rebill_core::{
    BillingInterval, Currency, CustomerId, PaymentProvider, PlanId, Price, Subscription,
    SubscriptionStatus,
};
use rebill_events::{EventDispatcher, EventKind, LifecycleEvent};
use rebill_lifecycle::{
    BillingConfig, BillingStore, ChargeType, GatewayError, InMemoryBillingStore,
    LifecycleOrchestrator, PaymentGateway, PaymentMethod, PaymentOutcome, PaymentRequest,
};

struct ScriptedGateway {
    outcomes: Mutex<VecDeque<PaymentOutcome>>,
    requests: Mutex<Vec<PaymentRequest>>,
}

impl ScriptedGateway {
    fn new(outcomes: Vec<PaymentOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl PaymentGateway for ScriptedGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentOutcome, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PaymentOutcome::Approved {
                payment_id: "pay_default".to_string(),
            }))
    }

    fn default_payment_method(
        &self,
        _customer_id: CustomerId,
    ) -> Result<Option<PaymentMethod>, GatewayError> {
        Ok(Some(PaymentMethod {
            id: "pm_1".to_string(),
            provider_payment_method_id: "card_1".to_string(),
        }))
    }
}

fn declined() -> PaymentOutcome {
    PaymentOutcome::Declined {
        reason: "Card declined".to_string(),
    }
}

fn approved(id: &str) -> PaymentOutcome {
    PaymentOutcome::Approved {
        payment_id: id.to_string(),
    }
}

struct World {
    store: Arc<InMemoryBillingStore>,
    gateway: Arc<ScriptedGateway>,
    orchestrator:
        LifecycleOrchestrator<Arc<InMemoryBillingStore>, Arc<ScriptedGateway>>,
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl World {
    fn new(outcomes: Vec<PaymentOutcome>) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(ScriptedGateway::new(outcomes));
        let dispatcher = Arc::new(EventDispatcher::<LifecycleEvent>::new(false));

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
            BillingConfig::default(),
        );

        Self {
            store,
            gateway,
            orchestrator,
            events,
        }
    }

    fn seed_due_subscription(&self, day0: DateTime<Utc>) -> Subscription {
        let plan_id = PlanId::new();
        self.store.add_price(Price::new(
            plan_id,
            Currency::new("usd").unwrap(),
            4900,
            BillingInterval::Month,
            1,
            day0,
        ));
        let mut sub = Subscription::new(
            CustomerId::new(),
            plan_id,
            BillingInterval::Month,
            1,
            day0 - Duration::days(31),
        );
        sub.current_period_end = day0;
        self.store.insert_subscription(sub.clone()).unwrap();
        sub
    }

    fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.event_type()).collect()
    }

    fn subscription(&self, sub: &Subscription) -> Subscription {
        self.store.get_subscription(sub.id).unwrap().unwrap()
    }
}

fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

#[test]
fn exhausted_dunning_ends_in_cancellation() {
    // Renewal and all three retries decline.
    let world = World::new(vec![declined(), declined(), declined(), declined()]);
    let day0 = day0();
    let sub = world.seed_due_subscription(day0);

    // Day 0: renewal declines, grace period starts.
    let summary = world.orchestrator.process_renewals(day0).unwrap();
    assert_eq!((summary.processed, summary.failed), (1, 1));
    assert_eq!(world.subscription(&sub).status, SubscriptionStatus::PastDue);

    // Retry slots: day 1, then +3 days, then +5 days.
    for (day, expected_count) in [(1, 1), (4, 2), (9, 3)] {
        let now = day0 + Duration::days(day);
        let summary = world.orchestrator.process_retries(now).unwrap();
        assert_eq!(summary.failed, 1, "retry on day {day}");

        let stored = world.subscription(&sub);
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(stored.dunning.retry_count, expected_count);
    }

    // A sweep between slots does nothing.
    let idle = world
        .orchestrator
        .process_retries(day0 + Duration::days(10))
        .unwrap();
    assert_eq!(idle.skipped, 1);
    assert_eq!(idle.processed, 0);

    // Day 15: grace period (14 days) has expired; no further charge.
    let payments_before = world.gateway.requests().len();
    let summary = world
        .orchestrator
        .process_cancellations(day0 + Duration::days(15))
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(world.gateway.requests().len(), payments_before);

    let stored = world.subscription(&sub);
    assert_eq!(stored.status, SubscriptionStatus::Canceled);
    assert_eq!(stored.canceled_at, Some(day0 + Duration::days(15)));

    // One renewal attempt plus three retries.
    assert_eq!(world.gateway.requests().len(), 4);
    let charge_types: Vec<ChargeType> = world
        .gateway
        .requests()
        .iter()
        .map(|r| r.metadata.charge_type)
        .collect();
    assert_eq!(
        charge_types,
        vec![
            ChargeType::Renewal,
            ChargeType::Retry,
            ChargeType::Retry,
            ChargeType::Retry
        ]
    );

    assert_eq!(
        world.event_types(),
        vec![
            "subscription.renewal_failed",
            "subscription.entered_grace_period",
            "subscription.retry_failed",
            "subscription.retry_failed",
            "subscription.retry_failed",
            "subscription.canceled_nonpayment",
        ]
    );
}

#[test]
fn a_successful_retry_recovers_mid_dunning() {
    // Renewal and first retry decline; the second retry goes through.
    let world = World::new(vec![declined(), declined(), approved("pay_recovered")]);
    let day0 = day0();
    let sub = world.seed_due_subscription(day0);

    world.orchestrator.process_renewals(day0).unwrap();
    world
        .orchestrator
        .process_retries(day0 + Duration::days(1))
        .unwrap();

    let recovery_day = day0 + Duration::days(4);
    let summary = world.orchestrator.process_retries(recovery_day).unwrap();
    assert_eq!(summary.succeeded, 1);

    let stored = world.subscription(&sub);
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert_eq!(stored.dunning, Default::default());
    assert_eq!(stored.current_period_start, recovery_day);
    assert_eq!(
        stored.current_period_end,
        BillingInterval::Month.advance(recovery_day, 1)
    );

    // Nothing left for the cancellation sweep, even well past the grace window.
    let summary = world
        .orchestrator
        .process_cancellations(day0 + Duration::days(30))
        .unwrap();
    assert_eq!(summary.processed + summary.skipped, 0);

    assert_eq!(
        world.event_types(),
        vec![
            "subscription.renewal_failed",
            "subscription.entered_grace_period",
            "subscription.retry_failed",
            "subscription.retry_succeeded",
        ]
    );
}

#[test]
fn process_all_runs_the_full_cycle_in_order() {
    let world = World::new(vec![declined()]);
    let day0 = day0();
    let sub = world.seed_due_subscription(day0);

    let report = world.orchestrator.process_all(day0).unwrap();
    assert_eq!(report.renewals.failed, 1);
    assert_eq!(report.trial_conversions.processed, 0);
    // Freshly past_due: first retry slot is a day away, grace period fresh.
    assert_eq!(report.retries.skipped, 1);
    assert_eq!(report.cancellations.skipped, 1);

    assert_eq!(world.subscription(&sub).status, SubscriptionStatus::PastDue);
}
