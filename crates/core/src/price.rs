//! Plan pricing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::id::{PlanId, PriceId};
use crate::subscription::BillingInterval;

/// ISO-4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Parse and normalize a currency code (three ASCII letters, stored uppercase).
    pub fn new(code: impl Into<String>) -> BillingResult<Self> {
        let code: String = code.into();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::validation(format!(
                "invalid currency code: {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A price attached to a plan.
///
/// `unit_amount` is in the smallest currency unit (e.g. cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub id: PriceId,
    pub plan_id: PlanId,
    pub currency: Currency,
    pub unit_amount: u64,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Price {
    pub fn new(
        plan_id: PlanId,
        currency: Currency,
        unit_amount: u64,
        interval: BillingInterval,
        interval_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PriceId::new(),
            plan_id,
            currency,
            unit_amount,
            interval,
            interval_count,
            active: true,
            created_at: now,
        }
    }

    /// Total amount for a quantity of seats/units.
    pub fn amount_for(&self, quantity: u32) -> BillingResult<u64> {
        self.unit_amount
            .checked_mul(u64::from(quantity))
            .ok_or_else(|| BillingError::invariant("price amount overflow"))
    }
}
