//! Subscription state transitions.
//!
//! ```text
//! pending ──payment──> active ──failed──> payment_due ──failed x N──> expired
//!                        │                     │
//!                        └──────cancel─────────┴──> cancelled
//! ```

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::events::{PaymentFailure, PaymentReceipt, WebhookEvent};
use super::model::{PaymentHistory, PaymentStatus, PlanType, Subscription, SubscriptionStatus};
use crate::config::SubscriptionConfig;
use crate::gateway::GatewayKind;

/// Retry and grace period rules for failed payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPolicy {
    pub max_payment_retries: u32,
    pub grace_period: Duration,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            max_payment_retries: 3,
            grace_period: Duration::days(3),
        }
    }
}

impl From<&SubscriptionConfig> for BillingPolicy {
    fn from(config: &SubscriptionConfig) -> Self {
        Self {
            max_payment_retries: config.max_payment_retries,
            grace_period: Duration::days(config.grace_period_days),
        }
    }
}

/// New subscription state plus the ledger row the event produced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub subscription: Subscription,
    pub ledger: Option<PaymentHistory>,
}

/// Apply a webhook event to a subscription.
pub fn apply(
    current: &Subscription,
    event: &WebhookEvent,
    now: DateTime<Utc>,
    policy: &BillingPolicy,
) -> Transition {
    let mut next = current.clone();
    next.updated_at = now;

    let ledger = match event {
        WebhookEvent::SubscriptionActivated(receipt) | WebhookEvent::PaymentSucceeded(receipt) => {
            let period_end = next.plan_type.next_billing_date(now);
            next.status = SubscriptionStatus::Active;
            next.current_period_start = Some(now);
            next.current_period_end = period_end;
            next.next_billing_date = period_end;
            next.last_payment_date = Some(now);
            next.last_payment_status = Some(PaymentStatus::Success);
            next.payment_retry_count = 0;
            next.payment_due_date = None;
            Some(success_row(current, receipt, now))
        }
        WebhookEvent::PaymentFailed(failure) => {
            next.payment_retry_count = next.payment_retry_count.saturating_add(1);
            next.last_payment_status = Some(PaymentStatus::Failed);
            if next.payment_retry_count >= policy.max_payment_retries {
                next.status = SubscriptionStatus::Expired;
            } else {
                next.status = SubscriptionStatus::PaymentDue;
                next.payment_due_date = Some(now + policy.grace_period);
            }
            Some(failure_row(current, failure, now))
        }
        WebhookEvent::SubscriptionCancelled | WebhookEvent::MandateRevoked => {
            next.status = SubscriptionStatus::Cancelled;
            next.cancelled_at = Some(now);
            None
        }
        WebhookEvent::MandateCreated { mandate_id } => {
            next.mandate_id = Some(mandate_id.clone());
            None
        }
    };

    Transition {
        subscription: next,
        ledger,
    }
}

fn success_row(sub: &Subscription, receipt: &PaymentReceipt, now: DateTime<Utc>) -> PaymentHistory {
    PaymentHistory {
        id: Uuid::new_v4(),
        user_id: sub.user_id.clone(),
        subscription_id: sub.subscription_id.clone(),
        transaction_id: receipt.transaction_id.clone(),
        amount_inr: receipt.amount_inr.unwrap_or(sub.amount_inr),
        status: PaymentStatus::Success,
        gateway: sub.payment_gateway,
        failure_reason: None,
        created_at: now,
    }
}

fn failure_row(sub: &Subscription, failure: &PaymentFailure, now: DateTime<Utc>) -> PaymentHistory {
    PaymentHistory {
        id: Uuid::new_v4(),
        user_id: sub.user_id.clone(),
        subscription_id: sub.subscription_id.clone(),
        transaction_id: failure.transaction_id.clone(),
        amount_inr: failure.amount_inr.unwrap_or(sub.amount_inr),
        status: PaymentStatus::Failed,
        gateway: sub.payment_gateway,
        failure_reason: failure.reason.clone(),
        created_at: now,
    }
}

/// A checkout has been opened with a gateway; wait for its confirmation.
pub fn start_checkout(
    current: Option<&Subscription>,
    user_id: &str,
    plan: PlanType,
    gateway: GatewayKind,
    external_id: String,
    amount_inr: u64,
    now: DateTime<Utc>,
) -> Subscription {
    let base = current
        .cloned()
        .unwrap_or_else(|| Subscription::free(user_id, now));

    Subscription {
        plan_type: plan,
        status: SubscriptionStatus::Pending,
        payment_gateway: Some(gateway),
        subscription_id: Some(external_id),
        mandate_id: None,
        current_period_start: None,
        current_period_end: None,
        next_billing_date: plan.next_billing_date(now),
        amount_inr,
        payment_retry_count: 0,
        payment_due_date: None,
        cancelled_at: None,
        updated_at: now,
        ..base
    }
}

/// User-initiated cancellation.
pub fn cancel(current: &Subscription, now: DateTime<Utc>) -> Subscription {
    Subscription {
        status: SubscriptionStatus::Cancelled,
        cancelled_at: Some(now),
        updated_at: now,
        ..current.clone()
    }
}

/// Drop an abandoned checkout and put the user back on the free plan.
pub fn abandon_checkout(current: &Subscription, now: DateTime<Utc>) -> Subscription {
    Subscription {
        created_at: current.created_at,
        ..Subscription::free(&current.user_id, now)
    }
}
