//! In-memory billing store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use rebill_core::{
    InvoiceId, OptimisticLockError, PlanId, Price, Subscription, SubscriptionFilter,
    SubscriptionId, SubscriptionPatch, VersionToken,
};

use crate::ports::{BillingStore, Invoice, InvoiceInput, StoreError};

/// In-memory [`BillingStore`].
///
/// The write lock makes each update atomic; the version comparison inside it
/// provides the same lost-update protection a `WHERE version = ?` predicate
/// gives a SQL backend.
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    prices: RwLock<HashMap<PlanId, Vec<Price>>>,
    invoices: RwLock<Vec<Invoice>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_price(&self, price: Price) {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        prices.entry(price.plan_id).or_default().push(price);
    }

    /// Snapshot of all invoices created so far (test observability).
    pub fn invoices(&self) -> Vec<Invoice> {
        self.invoices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl BillingStore for InMemoryBillingStore {
    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        Ok(subscriptions.get(&id).cloned())
    }

    fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<_> = subscriptions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    fn update_subscription(
        &self,
        id: SubscriptionId,
        patch: &SubscriptionPatch,
        expected_version: VersionToken,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let stored = subscriptions
            .get_mut(&id)
            .ok_or(StoreError::SubscriptionNotFound(id))?;

        if stored.version != expected_version {
            return Err(StoreError::OptimisticLock(OptimisticLockError::new(
                "subscription",
                id.to_string(),
            )));
        }

        let mut updated = stored.clone();
        updated.apply_patch(patch, now)?;
        *stored = updated.clone();
        Ok(updated)
    }

    fn prices_for_plan(&self, plan_id: PlanId) -> Result<Vec<Price>, StoreError> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        Ok(prices.get(&plan_id).cloned().unwrap_or_default())
    }

    fn create_invoice(
        &self,
        input: InvoiceInput,
        now: DateTime<Utc>,
    ) -> Result<Invoice, StoreError> {
        let invoice = Invoice {
            id: InvoiceId::new(),
            subscription_id: input.subscription_id,
            customer_id: input.customer_id,
            amount: input.amount,
            currency: input.currency,
            charge_type: input.charge_type,
            created_at: now,
        };
        let mut invoices = self.invoices.write().unwrap_or_else(|e| e.into_inner());
        invoices.push(invoice.clone());
        Ok(invoice)
    }
}
