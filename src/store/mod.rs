//! Persistence seams for rate limit records, subscriptions and the payment ledger.
//!
//! Every row carries a version. Writers pass the version they read and the
//! store rejects the write with [`TollgateError::Conflict`] if another writer
//! got there first, so read-modify-write cycles can retry instead of
//! overwriting each other.
//!
//! [`TollgateError::Conflict`]: crate::error::TollgateError::Conflict

mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::{RateLimitKey, RateLimitRecord};
use crate::subscription::{PaymentHistory, Subscription};

pub use memory::MemoryStore;

/// A stored value together with its row version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// Storage for per-(user, action) attempt records.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get_attempts(&self, key: &RateLimitKey) -> Result<Option<Versioned<RateLimitRecord>>>;

    /// Write `record` if the stored version equals `expected`.
    ///
    /// `expected = None` means the row must not exist yet. Returns the new version.
    async fn put_attempts(
        &self,
        key: &RateLimitKey,
        record: RateLimitRecord,
        expected: Option<u64>,
    ) -> Result<u64>;
}

/// Storage for subscriptions, one row per user.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Versioned<Subscription>>>;

    /// Look up a row by its gateway-facing `subscription_id`.
    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Versioned<Subscription>>>;

    /// Conditional upsert keyed by `subscription.user_id`. Same contract as
    /// [`RateLimitStore::put_attempts`].
    async fn put_subscription(&self, subscription: Subscription, expected: Option<u64>)
        -> Result<u64>;

    async fn list_pending(&self) -> Result<Vec<Versioned<Subscription>>>;
}

/// Append-only payment ledger.
#[async_trait]
pub trait PaymentHistoryStore: Send + Sync {
    /// Append a row. A `transaction_id` already present in the ledger is a conflict.
    async fn append_payment(&self, entry: PaymentHistory) -> Result<()>;

    /// Remove a row and free its `transaction_id`. Removing an absent row is not an error.
    async fn remove_payment(&self, id: Uuid) -> Result<()>;

    /// Rows for a user, newest first.
    async fn payments_for_user(&self, user_id: &str) -> Result<Vec<PaymentHistory>>;
}

/// Everything the service needs from a backing store.
pub trait Store: RateLimitStore + SubscriptionStore + PaymentHistoryStore {}

impl<T: RateLimitStore + SubscriptionStore + PaymentHistoryStore> Store for T {}
