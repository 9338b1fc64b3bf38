//! Core job types and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use rebill_core::RetryPolicy;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind for routing to the appropriate handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One lifecycle sweep (e.g. "lifecycle.renewals").
    LifecycleSweep { sweep: String },
    /// Generic/custom job.
    Custom { kind: String },
}

impl JobKind {
    pub fn lifecycle_sweep(sweep: impl Into<String>) -> Self {
        Self::LifecycleSweep {
            sweep: sweep.into(),
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    pub fn type_name(&self) -> &str {
        match self {
            JobKind::LifecycleSweep { sweep } => sweep,
            JobKind::Custom { kind } => kind,
        }
    }
}

/// Dequeue priority. `Critical` drains before `High`, and so on down.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Job execution status.
///
/// `Completed`, `Failed` and `Canceled` are terminal: entered at most once,
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, eligible as soon as `scheduled_at` passes.
    Pending,
    /// Explicitly scheduled for a later instant.
    Scheduled,
    /// Currently being executed.
    Running,
    /// Finished successfully.
    Completed,
    /// Attempt budget exhausted; an operator has to act.
    Failed,
    /// Cancelled before completion.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether a job in this status can be picked up once its time arrives.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled)
    }
}

/// Rejected job state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobTransitionError {
    #[error("job is terminal ({status:?}) and cannot change state")]
    Terminal { status: JobStatus },
    #[error("job must be running for this transition, was {status:?}")]
    NotRunning { status: JobStatus },
    #[error("job is not claimable in status {status:?}")]
    NotClaimable { status: JobStatus },
    #[error("attempt budget exhausted ({max_attempts})")]
    AttemptsExhausted { max_attempts: u32 },
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Human-readable label for logs and operator tooling.
    pub name: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Opaque payload handed to the handler.
    pub payload: serde_json::Value,

    /// Earliest instant the job may run.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Completed executions so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    /// Delay schedule between attempts. `None` means a failed attempt is
    /// immediately eligible again; the attempt limit always comes from
    /// `max_attempts`.
    pub backoff: Option<RetryPolicy>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind, name: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            name: name.into(),
            priority: JobPriority::Normal,
            status: JobStatus::Pending,
            payload,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            backoff: None,
            created_at: now,
            updated_at: now,
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

    /// Defer the job to a later instant.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Scheduled;
        self.scheduled_at = at;
        self
    }

    /// Ready iff claimable and its time has arrived.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now
    }

    /// Begin an execution attempt.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        if self.status.is_terminal() {
            return Err(JobTransitionError::Terminal {
                status: self.status,
            });
        }
        if !self.status.is_claimable() {
            return Err(JobTransitionError::NotClaimable {
                status: self.status,
            });
        }
        if self.attempts >= self.max_attempts {
            return Err(JobTransitionError::AttemptsExhausted {
                max_attempts: self.max_attempts,
            });
        }
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Finish the current attempt successfully.
    pub fn complete(
        &mut self,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if self.status != JobStatus::Running {
            return Err(JobTransitionError::NotRunning {
                status: self.status,
            });
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = result;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With budget left the job returns to `Pending` (pushed out by the
    /// backoff schedule, if one is set); otherwise it lands in the terminal
    /// `Failed` status.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if self.status != JobStatus::Running {
            return Err(JobTransitionError::NotRunning {
                status: self.status,
            });
        }
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            self.status = JobStatus::Pending;
            let delay = self
                .backoff
                .as_ref()
                .map(|p| p.delay_for_attempt(self.attempts))
                .unwrap_or_default();
            self.scheduled_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        } else {
            self.status = JobStatus::Failed;
            self.failed_at = Some(now);
        }
        Ok(())
    }

    /// Cancel the job. No-op (returns false) when already terminal.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Canceled;
        self.updated_at = now;
        true
    }

    /// Move the job to a new execution time.
    pub fn reschedule(
        &mut self,
        new_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if self.status.is_terminal() {
            return Err(JobTransitionError::Terminal {
                status: self.status,
            });
        }
        if !self.status.is_claimable() {
            return Err(JobTransitionError::NotClaimable {
                status: self.status,
            });
        }
        self.status = JobStatus::Scheduled;
        self.scheduled_at = new_at;
        self.updated_at = now;
        Ok(())
    }
}
