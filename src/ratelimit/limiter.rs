//! Store-backed attempt limiter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, trace, warn};

use super::policy::{self, Evaluation, LockoutPolicy, RateLimitStatus};
use super::record::{RateLimitKey, RateLimitRecord};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::RateLimitStore;

/// Default number of conditional write attempts per operation.
const DEFAULT_WRITE_RETRIES: u32 = 5;

/// Limits attempts per (user, action type) and locks keys out after the threshold.
///
/// Every mutation is a read-evaluate-write cycle guarded by the row version,
/// so concurrent callers on the same key retry rather than overwrite each other.
pub struct RateLimiter<S> {
    store: Arc<S>,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
    max_write_retries: u32,
}

impl<S: RateLimitStore> RateLimiter<S> {
    /// Create a new rate limiter using the system clock.
    pub fn new(store: Arc<S>, policy: LockoutPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, policy: LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            max_write_retries: DEFAULT_WRITE_RETRIES,
        }
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Report the status of a key, creating, resetting or blocking its record.
    ///
    /// Store failures fail open: the caller gets an unblocked status with no
    /// attempts rather than an error.
    pub async fn check(&self, user_id: &str, action_type: &str) -> Result<RateLimitStatus> {
        let key = RateLimitKey::new(user_id, action_type)?;

        match self.apply(&key, policy::evaluate).await {
            Ok(status) => {
                if status.blocked {
                    debug!(key = %key, reset_time = ?status.reset_time, "Key is locked out");
                }
                Ok(status)
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                Ok(RateLimitStatus::open(0, &self.policy))
            }
        }
    }

    /// Count one attempt. Callers invoke this only after a real attempt.
    pub async fn increment(&self, user_id: &str, action_type: &str) -> Result<()> {
        let key = RateLimitKey::new(user_id, action_type)?;

        self.apply(&key, |record, now, _| Evaluation {
            write: Some(policy::increment(record, now)),
            status: RateLimitStatus::open(0, &self.policy),
        })
        .await
        .map(|_| ())
        .map_err(|e| {
            error!(key = %key, error = %e, "Failed to increment rate limit");
            e
        })
    }

    /// Check and count in one step. Blocked keys are not counted.
    pub async fn record_attempt(&self, user_id: &str, action_type: &str) -> Result<RateLimitStatus> {
        let key = RateLimitKey::new(user_id, action_type)?;

        match self.apply(&key, policy::record_attempt).await {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Recording attempt failed, allowing request"
                );
                Ok(RateLimitStatus::open(0, &self.policy))
            }
        }
    }

    /// Record an attempt for an in-process caller, failing with
    /// [`TollgateError::RateLimited`] when the key is locked out.
    pub async fn guard(&self, user_id: &str, action_type: &str) -> Result<RateLimitStatus> {
        let status = self.record_attempt(user_id, action_type).await?;
        if status.blocked {
            let reason = status
                .reason
                .unwrap_or_else(|| "Too many attempts".to_string());
            return Err(TollgateError::RateLimited(reason));
        }
        Ok(status)
    }

    /// Run a transition against the stored record, retrying on version conflicts.
    async fn apply<F>(&self, key: &RateLimitKey, transition: F) -> Result<RateLimitStatus>
    where
        F: Fn(Option<&RateLimitRecord>, DateTime<Utc>, &LockoutPolicy) -> Evaluation,
    {
        for attempt in 0..=self.max_write_retries {
            let current = self.store.get_attempts(key).await?;
            let now = self.clock.now();
            let evaluation = transition(current.as_ref().map(|v| &v.value), now, &self.policy);

            let Some(record) = evaluation.write else {
                return Ok(evaluation.status);
            };

            let expected = current.map(|v| v.version);
            match self.store.put_attempts(key, record, expected).await {
                Ok(version) => {
                    trace!(key = %key, version, "Rate limit record updated");
                    return Ok(evaluation.status);
                }
                Err(TollgateError::Conflict(_)) => {
                    debug!(key = %key, attempt, "Concurrent update, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TollgateError::Conflict(key.to_string()))
    }
}
