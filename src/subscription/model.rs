//! Subscription rows, plans and ledger entries.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewayKind;

/// Plan a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    ProMonthly,
    ProYearly,
}

impl PlanType {
    pub fn is_pro(&self) -> bool {
        matches!(self, PlanType::ProMonthly | PlanType::ProYearly)
    }

    /// The end of a billing period starting at `from`. Free plans are not billed.
    pub fn next_billing_date(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            PlanType::Free => None,
            PlanType::ProMonthly => from.checked_add_months(Months::new(1)),
            PlanType::ProYearly => from.checked_add_months(Months::new(12)),
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanType::Free => "free",
            PlanType::ProMonthly => "pro_monthly",
            PlanType::ProYearly => "pro_yearly",
        };
        f.write_str(name)
    }
}

/// Billing status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Checkout started, gateway has not confirmed
    Pending,
    Active,
    /// Last payment failed, still inside the grace period
    PaymentDue,
    Cancelled,
    /// Retries exhausted
    Expired,
}

/// Outcome recorded for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Success,
    Failed,
    Refunded,
}

/// A user's subscription. One row per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub payment_gateway: Option<GatewayKind>,
    /// Reference the gateway reports back in webhooks
    pub subscription_id: Option<String>,
    pub mandate_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub amount_inr: u64,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub last_payment_status: Option<PaymentStatus>,
    pub payment_retry_count: u32,
    /// Set whenever status is `payment_due`
    pub payment_due_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The row every user starts with.
    pub fn free(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            plan_type: PlanType::Free,
            status: SubscriptionStatus::Active,
            payment_gateway: None,
            subscription_id: None,
            mandate_id: None,
            current_period_start: None,
            current_period_end: None,
            next_billing_date: None,
            amount_inr: 0,
            last_payment_date: None,
            last_payment_status: None,
            payment_retry_count: 0,
            payment_due_date: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pro features are kept through the grace period after a failed payment.
    pub fn is_pro(&self) -> bool {
        self.plan_type.is_pro()
            && matches!(
                self.status,
                SubscriptionStatus::Active | SubscriptionStatus::PaymentDue
            )
    }
}

/// One row of the append-only payment ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHistory {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Option<String>,
    /// Gateway transaction reference, unique across the ledger
    pub transaction_id: Option<String>,
    pub amount_inr: u64,
    pub status: PaymentStatus,
    pub gateway: Option<GatewayKind>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn with(plan: PlanType, status: SubscriptionStatus) -> Subscription {
        Subscription {
            plan_type: plan,
            status,
            ..Subscription::free("u1", Utc::now())
        }
    }

    #[test]
    fn test_is_pro_truth_table() {
        use SubscriptionStatus::*;

        for plan in [PlanType::ProMonthly, PlanType::ProYearly] {
            assert!(with(plan, Active).is_pro());
            assert!(with(plan, PaymentDue).is_pro());
            assert!(!with(plan, Cancelled).is_pro());
            assert!(!with(plan, Expired).is_pro());
            assert!(!with(plan, Pending).is_pro());
        }

        for status in [Active, PaymentDue, Cancelled, Expired, Pending] {
            assert!(!with(PlanType::Free, status).is_pro());
        }
    }

    #[test]
    fn test_billing_periods_are_calendar_exact() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();

        assert_eq!(PlanType::Free.next_billing_date(start), None);
        assert_eq!(
            PlanType::ProMonthly.next_billing_date(start),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap())
        );
        assert_eq!(
            PlanType::ProYearly.next_billing_date(start),
            Some(Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(PlanType::ProMonthly).unwrap(),
            serde_json::json!("pro_monthly")
        );
        assert_eq!(
            serde_json::to_value(SubscriptionStatus::PaymentDue).unwrap(),
            serde_json::json!("payment_due")
        );
        let plan: PlanType = serde_json::from_str("\"pro_yearly\"").unwrap();
        assert_eq!(plan, PlanType::ProYearly);
    }
}
