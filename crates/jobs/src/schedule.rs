//! Cron-driven job generation.
//!
//! A [`Schedule`] owns a cron expression and a job template; the
//! [`ScheduleRunner`] materializes a new [`Job`] whenever a schedule comes
//! due. Jobs already created are independent of their schedule: disabling or
//! deleting a schedule never touches them.
//!
//! The cron grammar is the classic 5-field form (minute, hour, day-of-month,
//! month, day-of-week) with `*`, lists, ranges and steps. Day-of-month and
//! day-of-week combine with OR when both are restricted, matching the
//! traditional behavior.

use std::str::FromStr;
use std::sync::{Arc, RwLock, mpsc};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use rebill_core::RetryPolicy;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobKind, JobPriority};

/// Unique schedule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cron expression parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid value {value:?} in field {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("value {value} out of range {min}..={max} in field {field}")]
    OutOfRange {
        field: &'static str,
        value: u8,
        min: u8,
        max: u8,
    },
}

/// Parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    source: String,
    minutes: Vec<u8>,
    hours: Vec<u8>,
    days_of_month: Vec<u8>,
    months: Vec<u8>,
    days_of_week: Vec<u8>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression matches the given instant (second granularity
    /// is ignored; cron resolves to minutes).
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&(at.minute() as u8))
            && self.hours.contains(&(at.hour() as u8))
            && self.matches_day(at.date_naive())
    }

    /// The next matching instant strictly after `after`, if one exists within
    /// the scan horizon (4 years covers every satisfiable field combination,
    /// leap days included).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(366 * 4);

        while t <= limit {
            if !self.matches_day(t.date_naive()) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if !self.hours.contains(&(t.hour() as u8)) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if self.minutes.contains(&(t.minute() as u8)) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&(date.month() as u8)) {
            return false;
        }
        let dom_match = self.days_of_month.contains(&(date.day() as u8));
        let dow_match = self
            .days_of_week
            .contains(&(date.weekday().num_days_from_sunday() as u8));

        match (self.dom_restricted, self.dow_restricted) {
            // Traditional OR rule when both day fields are restricted.
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }
}

fn parse_field(
    field: &'static str,
    spec: &str,
    min: u8,
    max: u8,
) -> Result<(Vec<u8>, bool), CronParseError> {
    if spec == "*" {
        return Ok(((min..=max).collect(), false));
    }

    let invalid = || CronParseError::InvalidValue {
        field,
        value: spec.to_string(),
    };

    let mut values = Vec::new();
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                lo.parse().map_err(|_| invalid())?,
                hi.parse().map_err(|_| invalid())?,
            )
        } else {
            let value: u8 = range.parse().map_err(|_| invalid())?;
            // A bare value with a step runs from the value to the field max.
            if step > 1 { (value, max) } else { (value, value) }
        };

        for value in [lo, hi] {
            if value < min || value > max {
                return Err(CronParseError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
        }
        if lo > hi {
            return Err(invalid());
        }

        values.extend((lo..=hi).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok((values, true))
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let (minutes, _) = parse_field("minute", fields[0], 0, 59)?;
        let (hours, _) = parse_field("hour", fields[1], 0, 23)?;
        let (days_of_month, dom_restricted) = parse_field("day-of-month", fields[2], 1, 31)?;
        let (months, _) = parse_field("month", fields[3], 1, 12)?;
        let (mut days_of_week, dow_restricted) = parse_field("day-of-week", fields[4], 0, 7)?;

        // Both 0 and 7 mean Sunday.
        for d in &mut days_of_week {
            if *d == 7 {
                *d = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            source: s.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }
}

impl TryFrom<String> for CronExpr {
    type Error = CronParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CronExpr> for String {
    fn from(value: CronExpr) -> Self {
        value.source
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Template for the jobs a schedule creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub kind: JobKind,
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub max_attempts: u32,
    pub backoff: Option<RetryPolicy>,
}

impl JobTemplate {
    pub fn new(kind: JobKind, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            payload,
            priority: JobPriority::Normal,
            max_attempts: 3,
            backoff: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, policy: RetryPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    fn build(&self, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(self.kind.clone(), self.name.clone(), self.payload.clone(), now)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts);
        job.backoff = self.backoff.clone();
        job
    }
}

/// A recurring job generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub cron: CronExpr,
    pub template: JobTemplate,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cron: CronExpr, template: JobTemplate, now: DateTime<Utc>) -> Self {
        let next_run_at = cron.next_after(now);
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            cron,
            template,
            enabled: true,
            last_run_at: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enable or disable the schedule.
    ///
    /// Re-enabling recomputes `next_run_at` from `now`, so time spent
    /// disabled does not produce a backlog. Jobs already created are never
    /// affected.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled && !self.enabled {
            self.next_run_at = self.cron.next_after(now);
        }
        self.enabled = enabled;
        self.updated_at = now;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Materialize one job and advance the schedule.
    ///
    /// Runs missed while the process was down collapse into this single job.
    pub fn fire(&mut self, now: DateTime<Utc>) -> Job {
        self.last_run_at = Some(now);
        self.next_run_at = self.cron.next_after(now);
        self.updated_at = now;
        self.template.build(now)
    }
}

/// Drives schedules against a job store.
pub struct ScheduleRunner<S> {
    store: S,
    schedules: RwLock<Vec<Schedule>>,
}

/// Handle to control a spawned runner thread.
#[derive(Debug)]
pub struct ScheduleRunnerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ScheduleRunnerHandle {
    /// Request graceful shutdown and wait for the runner to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl<S> ScheduleRunner<S>
where
    S: JobStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            schedules: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, schedule: Schedule) -> ScheduleId {
        let id = schedule.id;
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        schedules.push(schedule);
        id
    }

    /// Returns false when the schedule does not exist.
    pub fn set_enabled(&self, id: ScheduleId, enabled: bool, now: DateTime<Utc>) -> bool {
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        match schedules.iter_mut().find(|s| s.id == id) {
            Some(schedule) => {
                schedule.set_enabled(enabled, now);
                true
            }
            None => false,
        }
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.schedules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fire every due schedule once, enqueueing the produced jobs.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut fired = 0;
        let mut schedules = self.schedules.write().unwrap_or_else(|e| e.into_inner());
        for schedule in schedules.iter_mut() {
            if !schedule.is_due(now) {
                continue;
            }
            let job = schedule.fire(now);
            debug!(schedule = %schedule.name, job_id = %job.id, "schedule fired");
            self.store.enqueue(job)?;
            fired += 1;
        }
        Ok(fired)
    }
}

impl<S> ScheduleRunner<S>
where
    S: JobStore + 'static,
{
    /// Spawn the runner in a background thread, ticking at `poll_interval`.
    pub fn spawn(runner: Arc<Self>, poll_interval: StdDuration) -> ScheduleRunnerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("schedule-runner".to_string())
            .spawn(move || {
                info!("schedule runner started");
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    if let Err(e) = runner.tick(Utc::now()) {
                        error!(error = %e, "schedule tick failed");
                    }
                    thread::sleep(poll_interval);
                }
                info!("schedule runner stopped");
            })
            .expect("failed to spawn schedule runner thread");

        ScheduleRunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
