//! Lockout policy and the pure transition rules for attempt records.
//!
//! Nothing here touches storage. [`evaluate`] and [`record_attempt`] take the
//! stored record (if any) and the current time and return the record to write
//! back together with the status to report.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::record::RateLimitRecord;
use crate::config::RateLimitingConfig;

/// How many attempts are allowed and how long a lockout lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lockout: Duration::hours(2),
        }
    }
}

impl From<&RateLimitingConfig> for LockoutPolicy {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            lockout: Duration::seconds(config.lockout_secs as i64),
        }
    }
}

/// What a caller is told about a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub attempts: u32,
    pub max_attempts: u32,
    pub remaining: u32,
    pub blocked: bool,
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateLimitStatus {
    pub fn open(attempts: u32, policy: &LockoutPolicy) -> Self {
        Self {
            attempts,
            max_attempts: policy.max_attempts,
            remaining: policy.max_attempts.saturating_sub(attempts),
            blocked: false,
            reset_time: None,
            reason: None,
        }
    }

    pub fn blocked(
        attempts: u32,
        policy: &LockoutPolicy,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attempts,
            max_attempts: policy.max_attempts,
            remaining: 0,
            blocked: true,
            reset_time: Some(until),
            reason: Some(format!(
                "Too many attempts. Try again in {} minutes.",
                minutes_until(now, until)
            )),
        }
    }
}

/// Whole minutes until `until`, rounded up.
fn minutes_until(now: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let millis = (until - now).num_milliseconds().max(0);
    (millis + 59_999) / 60_000
}

/// Outcome of applying a transition to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Record to persist, `None` when nothing changed
    pub write: Option<RateLimitRecord>,
    pub status: RateLimitStatus,
}

/// Decide the current status of a key, creating, resetting or blocking the
/// record as needed.
pub fn evaluate(
    record: Option<&RateLimitRecord>,
    now: DateTime<Utc>,
    policy: &LockoutPolicy,
) -> Evaluation {
    let Some(record) = record else {
        return Evaluation {
            write: Some(RateLimitRecord::new(now)),
            status: RateLimitStatus::open(0, policy),
        };
    };

    if let Some(until) = record.blocked_until {
        if until <= now {
            return Evaluation {
                write: Some(record.reset(now)),
                status: RateLimitStatus::open(0, policy),
            };
        }
        if record.is_blocked {
            return Evaluation {
                write: None,
                status: RateLimitStatus::blocked(record.attempt_count, policy, until, now),
            };
        }
    }

    if record.attempt_count >= policy.max_attempts {
        let until = now + policy.lockout;
        let blocked = RateLimitRecord {
            is_blocked: true,
            blocked_until: Some(until),
            ..record.clone()
        };
        return Evaluation {
            write: Some(blocked),
            status: RateLimitStatus::blocked(record.attempt_count, policy, until, now),
        };
    }

    Evaluation {
        write: None,
        status: RateLimitStatus::open(record.attempt_count, policy),
    }
}

/// Count one attempt without evaluating the lockout.
pub fn increment(record: Option<&RateLimitRecord>, now: DateTime<Utc>) -> RateLimitRecord {
    match record {
        Some(record) => record.incremented(now),
        None => RateLimitRecord::new(now).incremented(now),
    }
}

/// Evaluate and, unless blocked, count the attempt in the same transition.
pub fn record_attempt(
    record: Option<&RateLimitRecord>,
    now: DateTime<Utc>,
    policy: &LockoutPolicy,
) -> Evaluation {
    let evaluation = evaluate(record, now, policy);
    if evaluation.status.blocked {
        return evaluation;
    }

    let base = evaluation.write.as_ref().or(record);
    let counted = increment(base, now);
    let status = RateLimitStatus::open(counted.attempt_count, policy);

    Evaluation {
        write: Some(counted),
        status,
    }
}
