//! Tracing/logging initialization.
//!
//! Sweeps and the job executor log structured fields (`subscription_id`,
//! `sweep`, `job_id`); JSON output keeps those machine-readable for whatever
//! aggregates the process logs.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    // Default to info for the billing crates, warn elsewhere; RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,rebill_core=info,rebill_events=info,rebill_jobs=info,rebill_lifecycle=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
