//! `rebill-jobs` — deferred work scheduling.
//!
//! A [`Job`](types::Job) is one schedulable unit of lifecycle work (or any
//! other deferred task). Jobs live in a [`JobStore`](store::JobStore), are
//! claimed by priority, and re-attempt on failure up to their attempt budget.
//! A [`Schedule`](schedule::Schedule) materializes new jobs from a cron
//! expression; the [`JobExecutor`](executor::JobExecutor) drains the store.

pub mod executor;
pub mod schedule;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome};
pub use schedule::{
    CronExpr, CronParseError, JobTemplate, Schedule, ScheduleId, ScheduleRunner,
    ScheduleRunnerHandle,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobId, JobKind, JobPriority, JobStatus, JobTransitionError};
