//! Collaborator contracts consumed by the orchestrator.
//!
//! Both ports are synchronous `Send + Sync` traits: implementations block on
//! their own I/O, and callers run them from worker threads. The orchestrator
//! holds no lock across a port call; the version token it read is the only
//! state that crosses the boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rebill_core::{
    BillingError, Currency, CustomerId, InvoiceId, OptimisticLockError, PaymentProvider, Price,
    PlanId, Subscription, SubscriptionFilter, SubscriptionId, SubscriptionPatch, VersionToken,
};

/// What a charge is for. Travels with the payment as typed metadata.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    Renewal,
    TrialConversion,
    Retry,
}

impl ChargeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeType::Renewal => "renewal",
            ChargeType::TrialConversion => "trial_conversion",
            ChargeType::Retry => "retry",
        }
    }
}

/// Typed metadata attached to every payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub subscription_id: SubscriptionId,
    pub charge_type: ChargeType,
}

/// One charge attempt against a customer's default payment method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub customer_id: CustomerId,
    /// Amount in the smallest currency unit.
    pub amount: u64,
    pub currency: Currency,
    pub metadata: PaymentMetadata,
}

/// Outcome of a charge attempt.
///
/// An ordinary decline is a `Declined` value, never a [`GatewayError`]; the
/// error type is reserved for transport and provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PaymentOutcome {
    Approved { payment_id: String },
    Declined { reason: String },
}

impl PaymentOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, PaymentOutcome::Approved { .. })
    }
}

/// A customer's stored payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub provider_payment_method_id: String,
}

/// Transport/provider failure, distinct from a business decline.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway error: {0}")]
    Other(String),
}

/// Payment execution port. One implementation per provider; the orchestrator
/// depends only on this trait.
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentOutcome, GatewayError>;

    fn default_payment_method(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<PaymentMethod>, GatewayError>;
}

impl<G> PaymentGateway for Arc<G>
where
    G: PaymentGateway + ?Sized,
{
    fn provider(&self) -> PaymentProvider {
        (**self).provider()
    }

    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentOutcome, GatewayError> {
        (**self).process_payment(request)
    }

    fn default_payment_method(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<PaymentMethod>, GatewayError> {
        (**self).default_payment_method(customer_id)
    }
}

/// Input for materializing a billable line before charging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceInput {
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub amount: u64,
    pub currency: Currency,
    pub charge_type: ChargeType,
}

/// A materialized invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub subscription_id: SubscriptionId,
    pub customer_id: CustomerId,
    pub amount: u64,
    pub currency: Currency,
    pub charge_type: ChargeType,
    pub created_at: DateTime<Utc>,
}

/// Storage port error.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error(transparent)]
    OptimisticLock(#[from] OptimisticLockError),
    #[error(transparent)]
    Domain(#[from] BillingError),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether this error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::OptimisticLock(_))
    }
}

/// Storage port.
///
/// The only shared mutable resource in the system. Every subscription write
/// is a compare-and-swap on the version token; implementations must reject a
/// stale token with [`StoreError::OptimisticLock`] and must enforce the
/// lifecycle transition table when applying a patch.
pub trait BillingStore: Send + Sync {
    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError>;

    fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Version-checked read-modify-write. Returns the updated record with its
    /// freshly assigned version token.
    fn update_subscription(
        &self,
        id: SubscriptionId,
        patch: &SubscriptionPatch,
        expected_version: VersionToken,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;

    fn prices_for_plan(&self, plan_id: PlanId) -> Result<Vec<Price>, StoreError>;

    fn create_invoice(
        &self,
        input: InvoiceInput,
        now: DateTime<Utc>,
    ) -> Result<Invoice, StoreError>;
}

impl<S> BillingStore for Arc<S>
where
    S: BillingStore + ?Sized,
{
    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        (**self).insert_subscription(subscription)
    }

    fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        (**self).get_subscription(id)
    }

    fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, StoreError> {
        (**self).list_subscriptions(filter)
    }

    fn update_subscription(
        &self,
        id: SubscriptionId,
        patch: &SubscriptionPatch,
        expected_version: VersionToken,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        (**self).update_subscription(id, patch, expected_version, now)
    }

    fn prices_for_plan(&self, plan_id: PlanId) -> Result<Vec<Price>, StoreError> {
        (**self).prices_for_plan(plan_id)
    }

    fn create_invoice(
        &self,
        input: InvoiceInput,
        now: DateTime<Utc>,
    ) -> Result<Invoice, StoreError> {
        (**self).create_invoice(input, now)
    }
}
