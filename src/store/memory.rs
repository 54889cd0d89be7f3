//! In-process store backed by concurrent maps.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;
use uuid::Uuid;

use super::{PaymentHistoryStore, RateLimitStore, SubscriptionStore, Versioned};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{RateLimitKey, RateLimitRecord};
use crate::subscription::{PaymentHistory, Subscription, SubscriptionStatus};

#[derive(Default)]
struct Ledger {
    rows: Vec<PaymentHistory>,
    transactions: HashSet<String>,
}

/// Store that keeps every table in memory.
///
/// Conditional writes are atomic per row: the version check and the write
/// happen while holding the map shard lock for that key.
#[derive(Default)]
pub struct MemoryStore {
    attempts: DashMap<RateLimitKey, Versioned<RateLimitRecord>>,
    subscriptions: DashMap<String, Versioned<Subscription>>,
    /// subscription_id -> user_id
    subscription_index: DashMap<String, String>,
    ledger: RwLock<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared compare-and-swap on a versioned map entry.
fn swap<K, T>(
    entry: Entry<'_, K, Versioned<T>>,
    value: T,
    expected: Option<u64>,
    what: impl FnOnce() -> String,
) -> Result<(u64, Option<T>)>
where
    K: Eq + std::hash::Hash,
{
    match entry {
        Entry::Occupied(mut occupied) => {
            let current = occupied.get().version;
            if expected != Some(current) {
                return Err(TollgateError::Conflict(what()));
            }
            let previous = occupied.insert(Versioned::new(value, current + 1));
            Ok((current + 1, Some(previous.value)))
        }
        Entry::Vacant(vacant) => {
            if expected.is_some() {
                return Err(TollgateError::Conflict(what()));
            }
            vacant.insert(Versioned::new(value, 1));
            Ok((1, None))
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get_attempts(&self, key: &RateLimitKey) -> Result<Option<Versioned<RateLimitRecord>>> {
        Ok(self.attempts.get(key).map(|r| r.value().clone()))
    }

    async fn put_attempts(
        &self,
        key: &RateLimitKey,
        record: RateLimitRecord,
        expected: Option<u64>,
    ) -> Result<u64> {
        let (version, _) = swap(self.attempts.entry(key.clone()), record, expected, || {
            format!("rate limit record {}", key)
        })?;
        trace!(key = %key, version, "Stored rate limit record");
        Ok(version)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Versioned<Subscription>>> {
        Ok(self.subscriptions.get(user_id).map(|r| r.value().clone()))
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Versioned<Subscription>>> {
        let user_id = match self.subscription_index.get(subscription_id) {
            Some(user_id) => user_id.value().clone(),
            None => return Ok(None),
        };
        self.get_subscription(&user_id).await
    }

    async fn put_subscription(
        &self,
        subscription: Subscription,
        expected: Option<u64>,
    ) -> Result<u64> {
        let user_id = subscription.user_id.clone();
        let new_external = subscription.subscription_id.clone();

        let (version, previous) = swap(
            self.subscriptions.entry(user_id.clone()),
            subscription,
            expected,
            || format!("subscription for user {}", user_id),
        )?;

        let old_external = previous.and_then(|p| p.subscription_id);
        if old_external != new_external {
            if let Some(old) = old_external {
                self.subscription_index.remove(&old);
            }
        }
        if let Some(new) = new_external {
            self.subscription_index.insert(new, user_id.clone());
        }

        trace!(user_id = %user_id, version, "Stored subscription");
        Ok(version)
    }

    async fn list_pending(&self) -> Result<Vec<Versioned<Subscription>>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|r| r.value().value.status == SubscriptionStatus::Pending)
            .map(|r| r.value().clone())
            .collect())
    }
}

#[async_trait]
impl PaymentHistoryStore for MemoryStore {
    async fn append_payment(&self, entry: PaymentHistory) -> Result<()> {
        let mut ledger = self.ledger.write();
        if let Some(ref transaction_id) = entry.transaction_id {
            if !ledger.transactions.insert(transaction_id.clone()) {
                return Err(TollgateError::Conflict(format!(
                    "transaction {}",
                    transaction_id
                )));
            }
        }
        ledger.rows.push(entry);
        Ok(())
    }

    async fn remove_payment(&self, id: Uuid) -> Result<()> {
        let mut ledger = self.ledger.write();
        if let Some(pos) = ledger.rows.iter().position(|row| row.id == id) {
            let row = ledger.rows.remove(pos);
            if let Some(transaction_id) = row.transaction_id {
                ledger.transactions.remove(&transaction_id);
            }
            trace!(payment_id = %id, "Removed ledger row");
        }
        Ok(())
    }

    async fn payments_for_user(&self, user_id: &str) -> Result<Vec<PaymentHistory>> {
        let ledger = self.ledger.read();
        Ok(ledger
            .rows
            .iter()
            .rev()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }
}
