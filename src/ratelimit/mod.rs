//! Attempt limiting for sensitive actions and its lockout state machine.

mod limiter;
mod policy;
mod record;

pub use limiter::RateLimiter;
pub use policy::{evaluate, increment, record_attempt, Evaluation, LockoutPolicy, RateLimitStatus};
pub use record::{RateLimitKey, RateLimitRecord};
