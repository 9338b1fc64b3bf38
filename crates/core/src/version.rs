//! Optimistic concurrency primitives.
//!
//! Every subscription write is a compare-and-swap on an opaque version token:
//! the caller supplies the token it last read, the write succeeds only if the
//! stored token still matches, and a successful write assigns a freshly
//! generated token. There is no held lock; the loser of a race observes an
//! [`OptimisticLockError`] and should re-read rather than blindly re-apply the
//! same computation (the record it lost to has usually already advanced).

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::error::BillingError;

/// Opaque per-record version token.
///
/// Tokens are compared only for equality; nothing about ordering or history
/// can be derived from them. A new token is generated on every successful
/// write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(Uuid);

impl VersionToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for VersionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for VersionToken {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| BillingError::invalid_id(format!("VersionToken: {e}")))?;
        Ok(Self(uuid))
    }
}

/// A compare-and-swap write matched zero records (id + expected version).
///
/// Names the entity type and id so callers can log which record raced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("optimistic lock conflict on {entity} {id}")]
pub struct OptimisticLockError {
    pub entity: &'static str,
    pub id: String,
}

impl OptimisticLockError {
    pub fn new(entity: &'static str, id: impl Into<String>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }
}

/// Re-execute a whole read-then-write operation on version conflicts.
///
/// `is_conflict` classifies errors; only conflicting ones are retried, up to
/// `policy.max_attempts` additional executions with the policy's backoff
/// between them. Any other error, and conflicts once retries are exhausted,
/// are returned to the caller unchanged.
///
/// The closure must re-read current state on every execution. After a lost
/// race the re-read typically shows the record already advanced, turning the
/// retry into a no-op.
pub fn with_conflict_retry<T, E, F>(
    policy: &RetryPolicy,
    is_conflict: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: core::fmt::Debug,
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && policy.should_retry(attempt) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = ?err, "version conflict, retrying");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
