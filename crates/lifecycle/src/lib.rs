//! `rebill-lifecycle` — the subscription lifecycle orchestrator.
//!
//! Composes the storage and payment ports, the optimistic-concurrency
//! primitives and the event dispatcher into four idempotent sweeps:
//! renewals, trial conversions, dunning retries and grace-period
//! cancellations. An external scheduler invokes the sweeps periodically;
//! every state change flows out as a typed lifecycle event.

pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod sweep_jobs;

pub use config::BillingConfig;
pub use memory::InMemoryBillingStore;
pub use orchestrator::{LifecycleOrchestrator, SweepError, SweepReport, SweepSummary};
pub use ports::{
    BillingStore, ChargeType, GatewayError, Invoice, InvoiceInput, PaymentGateway,
    PaymentMetadata, PaymentMethod, PaymentOutcome, PaymentRequest, StoreError,
};
pub use sweep_jobs::{
    SWEEP_ALL, SWEEP_CANCELLATIONS, SWEEP_RENEWALS, SWEEP_RETRIES, SWEEP_TRIAL_CONVERSIONS,
    register_sweep_handlers,
};
