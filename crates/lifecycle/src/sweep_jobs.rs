//! Binding between the job scheduler and the lifecycle sweeps.
//!
//! An external scheduler enqueues jobs with these kinds (typically through a
//! cron [`Schedule`](rebill_jobs::Schedule)); the executor routes them to the
//! orchestrator and stores the sweep summary as the job result.

use std::sync::Arc;

use chrono::Utc;

use rebill_jobs::{Job, JobExecutor, JobOutcome, JobStore};

use crate::orchestrator::LifecycleOrchestrator;
use crate::ports::{BillingStore, PaymentGateway};

pub const SWEEP_RENEWALS: &str = "lifecycle.renewals";
pub const SWEEP_TRIAL_CONVERSIONS: &str = "lifecycle.trial_conversions";
pub const SWEEP_RETRIES: &str = "lifecycle.retries";
pub const SWEEP_CANCELLATIONS: &str = "lifecycle.cancellations";
pub const SWEEP_ALL: &str = "lifecycle.process_all";

/// Register a handler for every `lifecycle.*` job kind.
///
/// Overlapping sweep jobs are safe to run concurrently: per-subscription
/// writes are version-checked, so at most one of two racing sweeps commits a
/// given record and the other re-reads it into a no-op.
pub fn register_sweep_handlers<JS, S, G>(
    executor: &mut JobExecutor<JS>,
    orchestrator: Arc<LifecycleOrchestrator<S, G>>,
) where
    JS: JobStore + 'static,
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    executor.register_handler("lifecycle.*", move |job: &Job| {
        let now = Utc::now();
        let result = match job.kind.type_name() {
            SWEEP_RENEWALS => orchestrator.process_renewals(now).map(to_json),
            SWEEP_TRIAL_CONVERSIONS => orchestrator.process_trial_conversions(now).map(to_json),
            SWEEP_RETRIES => orchestrator.process_retries(now).map(to_json),
            SWEEP_CANCELLATIONS => orchestrator.process_cancellations(now).map(to_json),
            SWEEP_ALL => orchestrator.process_all(now).map(to_json),
            other => {
                return JobOutcome::Failure(format!("unknown lifecycle sweep: {other}"));
            }
        };

        match result {
            Ok(value) => JobOutcome::Success(Some(value)),
            Err(e) => JobOutcome::Failure(e.to_string()),
        }
    });
}

fn to_json<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
