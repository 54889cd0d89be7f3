//! Attempt record keys and stored state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// A key that uniquely identifies an attempt record: one per user and action type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The user making attempts
    pub user_id: String,
    /// The guarded action, e.g. `otp_send` or `password_reset`
    pub action_type: String,
}

impl RateLimitKey {
    /// Create a new key, rejecting blank components.
    pub fn new(user_id: &str, action_type: &str) -> Result<Self> {
        let user_id = user_id.trim();
        let action_type = action_type.trim();

        if user_id.is_empty() {
            return Err(TollgateError::Validation("userId is required".to_string()));
        }
        if action_type.is_empty() {
            return Err(TollgateError::Validation(
                "actionType is required".to_string(),
            ));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            action_type: action_type.to_string(),
        })
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.action_type)
    }
}

/// Stored attempt state for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub attempt_count: u32,
    pub is_blocked: bool,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// Set whenever `is_blocked` is
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitRecord {
    /// A record with no attempts.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: 0,
            is_blocked: false,
            first_attempt_at: now,
            last_attempt_at: now,
            blocked_until: None,
        }
    }

    /// The state after the lockout window has passed.
    pub fn reset(&self, now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: 0,
            is_blocked: false,
            first_attempt_at: now,
            last_attempt_at: self.last_attempt_at,
            blocked_until: None,
        }
    }

    /// The state after one more attempt.
    pub fn incremented(&self, now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            last_attempt_at: now,
            ..self.clone()
        }
    }
}
