//! Subscription lifecycle operations over a store and the configured gateways.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::parse_webhook;
use super::machine::{self, BillingPolicy};
use super::model::{PaymentHistory, PlanType, Subscription, SubscriptionStatus};
use super::signature;
use crate::clock::{Clock, SystemClock};
use crate::config::SubscriptionConfig;
use crate::error::{Result, TollgateError};
use crate::gateway::{CheckoutParams, CheckoutRequest, CheckoutSession, GatewayKind, GatewayRegistry};
use crate::store::Store;

/// Default number of conditional write attempts per operation.
const DEFAULT_WRITE_RETRIES: u32 = 5;

const CANCEL_REASON: &str = "Cancelled by user";
const ABANDONED_REASON: &str = "Checkout superseded";

/// A subscription and whether it currently grants pro features.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub is_pro: bool,
}

impl From<Subscription> for SubscriptionView {
    fn from(subscription: Subscription) -> Self {
        let is_pro = subscription.is_pro();
        Self {
            subscription,
            is_pro,
        }
    }
}

/// A request to start a paid plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscription {
    pub plan_type: PlanType,
    #[serde(default)]
    pub gateway: Option<GatewayKind>,
    #[serde(default)]
    pub params: CheckoutParams,
}

/// What a webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        event: &'static str,
        status: SubscriptionStatus,
    },
    /// The transaction was already recorded; nothing changed
    Duplicate { transaction_id: String },
}

/// Plan prices in INR.
#[derive(Debug, Clone, Copy)]
struct Pricing {
    monthly: u64,
    yearly: u64,
}

impl Pricing {
    fn amount(&self, plan: PlanType) -> u64 {
        match plan {
            PlanType::Free => 0,
            PlanType::ProMonthly => self.monthly,
            PlanType::ProYearly => self.yearly,
        }
    }
}

/// Drives subscriptions through checkout, billing webhooks and cancellation.
pub struct SubscriptionService<S> {
    store: Arc<S>,
    gateways: GatewayRegistry,
    policy: BillingPolicy,
    pricing: Pricing,
    default_gateway: GatewayKind,
    pending_ttl: Duration,
    webhook_secret: Vec<u8>,
    clock: Arc<dyn Clock>,
    max_write_retries: u32,
}

impl<S: Store> SubscriptionService<S> {
    pub fn new(
        store: Arc<S>,
        gateways: GatewayRegistry,
        config: &SubscriptionConfig,
        webhook_secret: &str,
    ) -> Self {
        if webhook_secret.is_empty() {
            warn!("Webhook secret is not configured, all webhooks will be rejected");
        }

        Self {
            store,
            gateways,
            policy: BillingPolicy::from(config),
            pricing: Pricing {
                monthly: config.price_monthly_inr,
                yearly: config.price_yearly_inr,
            },
            default_gateway: config.default_gateway,
            pending_ttl: Duration::seconds(config.pending_ttl_secs as i64),
            webhook_secret: webhook_secret.as_bytes().to_vec(),
            clock: Arc::new(SystemClock),
            max_write_retries: DEFAULT_WRITE_RETRIES,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    /// Current subscription for a user, creating the free row on first sight.
    pub async fn status(&self, user_id: &str) -> Result<SubscriptionView> {
        let user_id = require_user(user_id)?;

        if let Some(current) = self.store.get_subscription(user_id).await? {
            return Ok(current.value.into());
        }

        let fresh = Subscription::free(user_id, self.clock.now());
        match self.store.put_subscription(fresh.clone(), None).await {
            Ok(_) => {
                info!(user_id = %user_id, "Created free subscription");
                Ok(fresh.into())
            }
            Err(TollgateError::Conflict(_)) => {
                // Another request created it first
                let current = self.store.get_subscription(user_id).await?.ok_or_else(|| {
                    TollgateError::Persistence(format!("subscription for {} vanished", user_id))
                })?;
                Ok(current.value.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Open a gateway checkout and record the pending subscription.
    pub async fn create(&self, user_id: &str, request: CreateSubscription) -> Result<CheckoutSession> {
        let user_id = require_user(user_id)?;
        let plan = request.plan_type;
        if !plan.is_pro() {
            return Err(TollgateError::Validation("Invalid plan type".to_string()));
        }

        let existing = self.store.get_subscription(user_id).await?;
        if existing.as_ref().is_some_and(|s| s.value.is_pro()) {
            return Err(TollgateError::Validation(
                "You already have an active subscription".to_string(),
            ));
        }

        let kind = request.gateway.unwrap_or(self.default_gateway);
        let gateway = self.gateways.get(kind)?;
        let amount_inr = self.pricing.amount(plan);
        let checkout = CheckoutRequest {
            user_id: user_id.to_string(),
            plan,
            amount_inr,
            reference: Uuid::new_v4().to_string(),
            params: request.params,
        };

        let session = gateway.create_checkout(&checkout).await.map_err(|e| {
            error!(user_id = %user_id, gateway = %kind, error = %e, "Checkout creation failed");
            e
        })?;

        // Only the row seen before the checkout opened may be replaced
        let seen = existing.and_then(|row| row.value.subscription_id);
        let external_id = session.external_id.clone();
        let recorded = self
            .update_with_retry(user_id, |current, now| {
                if current.is_some_and(Subscription::is_pro) {
                    return Err(TollgateError::Validation(
                        "You already have an active subscription".to_string(),
                    ));
                }
                if current.and_then(|c| c.subscription_id.as_ref()) != seen.as_ref() {
                    return Err(TollgateError::Validation(
                        "Another checkout was started, please try again".to_string(),
                    ));
                }
                Ok(machine::start_checkout(
                    current,
                    user_id,
                    plan,
                    kind,
                    external_id.clone(),
                    amount_inr,
                    now,
                ))
            })
            .await;

        let pending = match recorded {
            Ok(pending) => pending,
            Err(e) => {
                // The payment URL is never handed out, so close the checkout
                warn!(
                    user_id = %user_id,
                    gateway = %kind,
                    subscription_id = %session.external_id,
                    error = %e,
                    "Pending subscription not recorded, abandoning checkout"
                );
                if kind.has_recurring_billing() {
                    if let Err(cancel_err) =
                        gateway.cancel(&session.external_id, ABANDONED_REASON).await
                    {
                        error!(
                            subscription_id = %session.external_id,
                            gateway = %kind,
                            error = %cancel_err,
                            "Failed to cancel abandoned checkout"
                        );
                    }
                }
                return Err(e);
            }
        };

        info!(
            user_id = %user_id,
            plan = %plan,
            gateway = %kind,
            subscription_id = ?pending.subscription_id,
            next_billing_date = ?pending.next_billing_date,
            "Pending subscription recorded"
        );
        Ok(session)
    }

    /// Cancel a paid subscription. Recurring billing is stopped at the gateway first.
    pub async fn cancel(&self, user_id: &str) -> Result<Subscription> {
        let user_id = require_user(user_id)?;
        let current = self
            .store
            .get_subscription(user_id)
            .await?
            .ok_or_else(|| TollgateError::NotFound("No subscription found".to_string()))?
            .value;

        if !current.plan_type.is_pro() {
            return Err(TollgateError::Validation(
                "No active subscription to cancel".to_string(),
            ));
        }
        if matches!(
            current.status,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        ) {
            return Err(TollgateError::Validation(
                "Subscription is no longer active".to_string(),
            ));
        }

        if let (Some(kind), Some(external_id)) =
            (current.payment_gateway, current.subscription_id.as_deref())
        {
            if kind.has_recurring_billing() {
                let gateway = self.gateways.get(kind)?;
                gateway.cancel(external_id, CANCEL_REASON).await.map_err(|e| {
                    error!(
                        user_id = %user_id,
                        subscription_id = %external_id,
                        gateway = %kind,
                        error = %e,
                        "Gateway cancellation failed, subscription left unchanged"
                    );
                    e
                })?;
            }
        }

        let cancelled_id = current.subscription_id.as_deref();
        let cancelled = self
            .update_with_retry(user_id, |row, now| {
                let row = row
                    .ok_or_else(|| TollgateError::NotFound("No subscription found".to_string()))?;
                if row.subscription_id.as_deref() != cancelled_id {
                    warn!(
                        user_id = %user_id,
                        cancelled = ?cancelled_id,
                        current = ?row.subscription_id,
                        "Subscription replaced during cancellation"
                    );
                    return Err(TollgateError::Validation(
                        "Subscription changed during cancellation, please try again".to_string(),
                    ));
                }
                Ok(machine::cancel(row, now))
            })
            .await?;

        info!(user_id = %user_id, subscription_id = ?cancelled.subscription_id, "Subscription cancelled");
        Ok(cancelled)
    }

    /// Verify and apply a gateway webhook.
    pub async fn handle_webhook(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        let Some(signature) = signature else {
            warn!("Webhook rejected: missing signature");
            return Err(TollgateError::Auth("missing webhook signature".to_string()));
        };
        if !signature::verify(&self.webhook_secret, body, signature) {
            warn!("Webhook rejected: invalid signature");
            return Err(TollgateError::Auth("invalid webhook signature".to_string()));
        }

        let envelope = parse_webhook(body).map_err(|e| {
            warn!(error = %e, "Webhook rejected: unusable payload");
            e
        })?;
        let subscription_id = envelope.subscription_id.as_str();
        let event = &envelope.event;

        let found = self
            .store
            .find_by_subscription_id(subscription_id)
            .await?
            .ok_or_else(|| {
                warn!(subscription_id = %subscription_id, event = event.name(), "Webhook for unknown subscription");
                TollgateError::NotFound(format!("Subscription {} not found", subscription_id))
            })?
            .value;

        // The ledger row doubles as the dedup claim; it is released if the state write fails
        let preview = machine::apply(&found, event, self.clock.now(), &self.policy);
        let claim = match preview.ledger {
            Some(row) => {
                let id = row.id;
                match self.store.append_payment(row).await {
                    Ok(()) => Some(id),
                    Err(TollgateError::Conflict(_)) => {
                        let transaction_id = event.transaction_id().unwrap_or_default().to_string();
                        info!(
                            subscription_id = %subscription_id,
                            transaction_id = %transaction_id,
                            event = event.name(),
                            "Duplicate webhook delivery ignored"
                        );
                        return Ok(WebhookOutcome::Duplicate { transaction_id });
                    }
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        let result = self
            .update_with_retry(&found.user_id, |current, now| {
                let current = current
                    .filter(|c| c.subscription_id.as_deref() == Some(subscription_id))
                    .ok_or_else(|| {
                        TollgateError::NotFound(format!("Subscription {} not found", subscription_id))
                    })?;
                Ok(machine::apply(current, event, now, &self.policy).subscription)
            })
            .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                error!(
                    user_id = %found.user_id,
                    subscription_id = %subscription_id,
                    transaction_id = ?event.transaction_id(),
                    error = %e,
                    "Webhook state update failed, releasing ledger claim"
                );
                if let Some(id) = claim {
                    if let Err(release) = self.store.remove_payment(id).await {
                        error!(
                            payment_id = %id,
                            transaction_id = ?event.transaction_id(),
                            error = %release,
                            "Failed to release ledger claim, redelivery will be treated as duplicate"
                        );
                    }
                }
                return Err(e);
            }
        };

        info!(
            user_id = %updated.user_id,
            subscription_id = %subscription_id,
            event = event.name(),
            status = ?updated.status,
            retry_count = updated.payment_retry_count,
            "Webhook applied"
        );
        Ok(WebhookOutcome::Applied {
            event: event.name(),
            status: updated.status,
        })
    }

    /// Ledger rows for a user, newest first.
    pub async fn payments(&self, user_id: &str) -> Result<Vec<PaymentHistory>> {
        let user_id = require_user(user_id)?;
        self.store.payments_for_user(user_id).await
    }

    /// Revert pending subscriptions that were never confirmed. Returns how many were reverted.
    pub async fn reconcile_pending(&self) -> Result<usize> {
        let now = self.clock.now();
        let stale: Vec<_> = self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|row| row.value.updated_at + self.pending_ttl <= now)
            .collect();

        let results = futures::future::join_all(stale.into_iter().map(|row| async move {
            let reverted = machine::abandon_checkout(&row.value, now);
            self.store
                .put_subscription(reverted, Some(row.version))
                .await
                .map(|_| row.value)
        }))
        .await;

        let mut reverted = 0;
        for result in results {
            match result {
                Ok(sub) => {
                    info!(
                        user_id = %sub.user_id,
                        subscription_id = ?sub.subscription_id,
                        "Abandoned checkout reverted to free plan"
                    );
                    reverted += 1;
                }
                Err(TollgateError::Conflict(what)) => {
                    debug!(row = %what, "Pending subscription changed during reconciliation");
                }
                Err(e) => warn!(error = %e, "Failed to revert pending subscription"),
            }
        }
        Ok(reverted)
    }

    /// Read-modify-write a user's row, retrying on version conflicts.
    async fn update_with_retry<F>(&self, user_id: &str, mut change: F) -> Result<Subscription>
    where
        F: FnMut(Option<&Subscription>, DateTime<Utc>) -> Result<Subscription>,
    {
        for attempt in 0..=self.max_write_retries {
            let current = self.store.get_subscription(user_id).await?;
            let next = change(current.as_ref().map(|v| &v.value), self.clock.now())?;

            match self
                .store
                .put_subscription(next.clone(), current.map(|v| v.version))
                .await
            {
                Ok(_) => return Ok(next),
                Err(TollgateError::Conflict(_)) => {
                    debug!(user_id = %user_id, attempt, "Concurrent subscription update, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TollgateError::Conflict(format!("subscription for user {}", user_id)))
    }
}

fn require_user(user_id: &str) -> Result<&str> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(TollgateError::Validation("userId is required".to_string()));
    }
    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::PaymentGateway;
    use crate::ratelimit::{RateLimitKey, RateLimitRecord};
    use crate::store::{
        MemoryStore, PaymentHistoryStore, RateLimitStore, SubscriptionStore, Versioned,
    };
    use crate::subscription::PaymentStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SECRET: &str = "whsec_test";

    /// Gateway double that records cancellations.
    struct RecordingGateway {
        kind: GatewayKind,
        fail_cancel: bool,
        cancelled: Mutex<Vec<String>>,
    }

    impl RecordingGateway {
        fn new(kind: GatewayKind, fail_cancel: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail_cancel,
                cancelled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        fn kind(&self) -> GatewayKind {
            self.kind
        }

        async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
            Ok(CheckoutSession {
                payment_url: format!("https://pay.example/{}/{}", self.kind, request.reference),
                external_id: format!("EXT-{}", request.user_id),
            })
        }

        async fn cancel(&self, external_id: &str, _reason: &str) -> Result<()> {
            if self.fail_cancel {
                return Err(TollgateError::Gateway {
                    gateway: self.kind,
                    status: Some(500),
                    body: "{\"name\":\"INTERNAL_SERVICE_ERROR\"}".to_string(),
                });
            }
            self.cancelled.lock().push(external_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        service: SubscriptionService<MemoryStore>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        paypal: Arc<RecordingGateway>,
    }

    fn harness(paypal_cancel_fails: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let paypal = RecordingGateway::new(GatewayKind::PayPal, paypal_cancel_fails);

        let mut gateways = GatewayRegistry::new();
        gateways.register(paypal.clone());
        gateways.register(RecordingGateway::new(GatewayKind::PayU, true));

        let service = SubscriptionService::new(
            store.clone(),
            gateways,
            &SubscriptionConfig::default(),
            SECRET,
        )
        .with_clock(clock.clone());

        Harness {
            service,
            store,
            clock,
            paypal,
        }
    }

    fn create(plan: PlanType, gateway: Option<GatewayKind>) -> CreateSubscription {
        CreateSubscription {
            plan_type: plan,
            gateway,
            params: CheckoutParams::default(),
        }
    }

    async fn deliver<S: Store>(
        service: &SubscriptionService<S>,
        payload: serde_json::Value,
    ) -> Result<WebhookOutcome> {
        let body = serde_json::to_vec(&payload).unwrap();
        let signature = signature::sign(SECRET.as_bytes(), &body);
        service.handle_webhook(&body, Some(&signature)).await
    }

    async fn active_pro(h: &Harness, user_id: &str) {
        h.service
            .create(user_id, create(PlanType::ProMonthly, None))
            .await
            .unwrap();
        deliver(
            &h.service,
            json!({ "event": "subscription.activated", "subscriptionId": format!("EXT-{}", user_id), "transactionId": format!("T-{}", user_id) }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_status_creates_free_row() {
        let h = harness(false);

        let view = h.service.status("u1").await.unwrap();
        assert_eq!(view.subscription.plan_type, PlanType::Free);
        assert_eq!(view.subscription.status, SubscriptionStatus::Active);
        assert!(!view.is_pro);

        // Second call reads the same row
        assert_eq!(h.service.status("u1").await.unwrap(), view);
    }

    #[tokio::test]
    async fn test_create_records_pending_subscription() {
        let h = harness(false);
        h.service.status("u1").await.unwrap();

        let session = h
            .service
            .create("u1", create(PlanType::ProMonthly, None))
            .await
            .unwrap();
        assert!(session.payment_url.starts_with("https://pay.example/paypal/"));

        let sub = h.store.get_subscription("u1").await.unwrap().unwrap().value;
        let now = h.clock.now();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.plan_type, PlanType::ProMonthly);
        assert_eq!(sub.payment_gateway, Some(GatewayKind::PayPal));
        assert_eq!(sub.subscription_id.as_deref(), Some("EXT-u1"));
        assert_eq!(sub.amount_inr, 299);
        assert_eq!(sub.next_billing_date, PlanType::ProMonthly.next_billing_date(now));
    }

    #[tokio::test]
    async fn test_create_rejects_free_plan_and_existing_pro() {
        let h = harness(false);

        assert!(matches!(
            h.service.create("u1", create(PlanType::Free, None)).await,
            Err(TollgateError::Validation(_))
        ));

        active_pro(&h, "u1").await;
        assert!(matches!(
            h.service.create("u1", create(PlanType::ProYearly, None)).await,
            Err(TollgateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_with_unconfigured_gateway() {
        let h = harness(false);
        assert!(matches!(
            h.service
                .create("u1", create(PlanType::ProMonthly, Some(GatewayKind::PayIn)))
                .await,
            Err(TollgateError::Validation(_))
        ));
        assert!(h.store.get_subscription("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activation_webhook() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        let view = h.service.status("u1").await.unwrap();
        assert!(view.is_pro);
        assert_eq!(view.subscription.status, SubscriptionStatus::Active);
        assert_eq!(view.subscription.payment_retry_count, 0);

        let payments = h.service.payments("u1").await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Success);
        assert_eq!(payments[0].amount_inr, 299);
    }

    #[tokio::test]
    async fn test_duplicate_payment_is_applied_once() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        // One failure, then the same success delivered twice
        deliver(&h.service, json!({ "event": "payment.failed", "subscriptionId": "EXT-u1", "transactionId": "T-f1" }))
            .await
            .unwrap();
        let success = json!({ "event": "payment.success", "subscriptionId": "EXT-u1", "transactionId": "T-2" });
        let first = deliver(&h.service, success.clone()).await.unwrap();
        assert_eq!(
            first,
            WebhookOutcome::Applied {
                event: "payment.success",
                status: SubscriptionStatus::Active
            }
        );

        h.clock.advance(Duration::minutes(5));
        let second = deliver(&h.service, success).await.unwrap();
        assert_eq!(
            second,
            WebhookOutcome::Duplicate {
                transaction_id: "T-2".to_string()
            }
        );

        let payments = h.service.payments("u1").await.unwrap();
        assert_eq!(payments.len(), 3);
        let sub = h.service.status("u1").await.unwrap().subscription;
        assert!(sub.updated_at < h.clock.now(), "duplicate must not touch the row");
    }

    #[tokio::test]
    async fn test_failed_payments_walk_to_expired() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        let expected = [
            (SubscriptionStatus::PaymentDue, 1, true),
            (SubscriptionStatus::PaymentDue, 2, true),
            (SubscriptionStatus::Expired, 3, false),
        ];
        for (i, (status, retries, is_pro)) in expected.into_iter().enumerate() {
            deliver(
                &h.service,
                json!({ "event": "payment.failed", "subscriptionId": "EXT-u1", "transactionId": format!("F-{}", i) }),
            )
            .await
            .unwrap();

            let view = h.service.status("u1").await.unwrap();
            assert_eq!(view.subscription.status, status);
            assert_eq!(view.subscription.payment_retry_count, retries);
            assert_eq!(view.is_pro, is_pro);
            if status == SubscriptionStatus::PaymentDue {
                assert_eq!(
                    view.subscription.payment_due_date,
                    Some(h.clock.now() + Duration::days(3))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_bad_signature_changes_nothing() {
        let h = harness(false);
        active_pro(&h, "u1").await;
        let before = h.store.get_subscription("u1").await.unwrap().unwrap();

        let body = serde_json::to_vec(&json!({ "event": "subscription.cancelled", "subscriptionId": "EXT-u1" })).unwrap();
        let forged = signature::sign(b"not-the-secret", &body);

        assert!(matches!(
            h.service.handle_webhook(&body, Some(&forged)).await,
            Err(TollgateError::Auth(_))
        ));
        assert!(matches!(
            h.service.handle_webhook(&body, None).await,
            Err(TollgateError::Auth(_))
        ));
        assert_eq!(h.store.get_subscription("u1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_event_and_subscription_rejected() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        assert!(matches!(
            deliver(&h.service, json!({ "event": "invoice.paid", "subscriptionId": "EXT-u1" })).await,
            Err(TollgateError::Validation(_))
        ));
        assert!(matches!(
            deliver(&h.service, json!({ "event": "payment.success", "subscriptionId": "EXT-nobody" })).await,
            Err(TollgateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mandate_events() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        deliver(&h.service, json!({ "event": "mandate.created", "subscriptionId": "EXT-u1", "mandateId": "M-1" }))
            .await
            .unwrap();
        let sub = h.service.status("u1").await.unwrap().subscription;
        assert_eq!(sub.mandate_id.as_deref(), Some("M-1"));
        assert_eq!(sub.status, SubscriptionStatus::Active);

        deliver(&h.service, json!({ "event": "mandate.revoked", "subscriptionId": "EXT-u1" }))
            .await
            .unwrap();
        let sub = h.service.status("u1").await.unwrap().subscription;
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert_eq!(sub.cancelled_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_cancel_stops_gateway_billing_first() {
        let h = harness(false);
        active_pro(&h, "u1").await;

        let cancelled = h.service.cancel("u1").await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(h.clock.now()));
        assert_eq!(*h.paypal.cancelled.lock(), vec!["EXT-u1".to_string()]);

        assert!(matches!(
            h.service.cancel("u1").await,
            Err(TollgateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_gateway_cancel_failure_keeps_local_state() {
        let h = harness(true);
        active_pro(&h, "u1").await;

        let err = h.service.cancel("u1").await.unwrap_err();
        assert!(matches!(err, TollgateError::Gateway { .. }));

        let sub = h.service.status("u1").await.unwrap().subscription;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.cancelled_at, None);
    }

    #[tokio::test]
    async fn test_cancel_one_off_gateway_skips_upstream() {
        let h = harness(false);
        // The PayU double fails every cancel; it must not be called
        h.service
            .create("u1", create(PlanType::ProYearly, Some(GatewayKind::PayU)))
            .await
            .unwrap();
        deliver(&h.service, json!({ "event": "payment.success", "subscriptionId": "EXT-u1", "transactionId": "T-1" }))
            .await
            .unwrap();

        let cancelled = h.service.cancel("u1").await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_requires_paid_subscription() {
        let h = harness(false);

        assert!(matches!(
            h.service.cancel("u1").await,
            Err(TollgateError::NotFound(_))
        ));

        h.service.status("u1").await.unwrap();
        assert!(matches!(
            h.service.cancel("u1").await,
            Err(TollgateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_reverts_only_stale_pending() {
        let h = harness(false);
        h.service
            .create("old", create(PlanType::ProMonthly, None))
            .await
            .unwrap();
        h.clock.advance(Duration::hours(23));
        h.service
            .create("new", create(PlanType::ProMonthly, None))
            .await
            .unwrap();
        h.clock.advance(Duration::hours(2));

        assert_eq!(h.service.reconcile_pending().await.unwrap(), 1);

        let old = h.store.get_subscription("old").await.unwrap().unwrap().value;
        assert_eq!(old.plan_type, PlanType::Free);
        assert_eq!(old.status, SubscriptionStatus::Active);
        assert!(h.store.find_by_subscription_id("EXT-old").await.unwrap().is_none());

        let new = h.store.get_subscription("new").await.unwrap().unwrap().value;
        assert_eq!(new.status, SubscriptionStatus::Pending);
    }

    /// Memory store whose next subscription write can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_put: AtomicBool,
    }

    #[async_trait]
    impl RateLimitStore for FlakyStore {
        async fn get_attempts(
            &self,
            key: &RateLimitKey,
        ) -> Result<Option<Versioned<RateLimitRecord>>> {
            self.inner.get_attempts(key).await
        }

        async fn put_attempts(
            &self,
            key: &RateLimitKey,
            record: RateLimitRecord,
            expected: Option<u64>,
        ) -> Result<u64> {
            self.inner.put_attempts(key, record, expected).await
        }
    }

    #[async_trait]
    impl SubscriptionStore for FlakyStore {
        async fn get_subscription(&self, user_id: &str) -> Result<Option<Versioned<Subscription>>> {
            self.inner.get_subscription(user_id).await
        }

        async fn find_by_subscription_id(
            &self,
            subscription_id: &str,
        ) -> Result<Option<Versioned<Subscription>>> {
            self.inner.find_by_subscription_id(subscription_id).await
        }

        async fn put_subscription(
            &self,
            subscription: Subscription,
            expected: Option<u64>,
        ) -> Result<u64> {
            if self.fail_next_put.swap(false, Ordering::SeqCst) {
                return Err(TollgateError::Persistence("db down".to_string()));
            }
            self.inner.put_subscription(subscription, expected).await
        }

        async fn list_pending(&self) -> Result<Vec<Versioned<Subscription>>> {
            self.inner.list_pending().await
        }
    }

    #[async_trait]
    impl PaymentHistoryStore for FlakyStore {
        async fn append_payment(&self, entry: PaymentHistory) -> Result<()> {
            self.inner.append_payment(entry).await
        }

        async fn remove_payment(&self, id: Uuid) -> Result<()> {
            self.inner.remove_payment(id).await
        }

        async fn payments_for_user(&self, user_id: &str) -> Result<Vec<PaymentHistory>> {
            self.inner.payments_for_user(user_id).await
        }
    }

    /// Gateway double that lets a test mutate the store from inside a gateway call.
    struct HookGateway {
        on_create: Box<dyn Fn() + Send + Sync>,
        on_cancel: Box<dyn Fn() + Send + Sync>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentGateway for HookGateway {
        fn kind(&self) -> GatewayKind {
            GatewayKind::PayPal
        }

        async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
            (self.on_create)();
            Ok(CheckoutSession {
                payment_url: format!("https://pay.example/paypal/{}", request.reference),
                external_id: format!("EXT-{}", request.reference),
            })
        }

        async fn cancel(&self, external_id: &str, _reason: &str) -> Result<()> {
            (self.on_cancel)();
            self.cancelled.lock().push(external_id.to_string());
            Ok(())
        }
    }

    /// Write a pending row for `user_id` under `external_id`, as a competing request would.
    fn pending_row(store: &MemoryStore, user_id: &str, external_id: &str) {
        let current = futures::executor::block_on(store.get_subscription(user_id)).unwrap();
        let next = machine::start_checkout(
            current.as_ref().map(|v| &v.value),
            user_id,
            PlanType::ProMonthly,
            GatewayKind::PayPal,
            external_id.to_string(),
            299,
            Utc::now(),
        );
        futures::executor::block_on(store.put_subscription(next, current.map(|v| v.version)))
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_state_write_does_not_swallow_redelivery() {
        let store = Arc::new(FlakyStore::default());
        let mut gateways = GatewayRegistry::new();
        gateways.register(RecordingGateway::new(GatewayKind::PayPal, false));
        let service =
            SubscriptionService::new(store.clone(), gateways, &SubscriptionConfig::default(), SECRET);

        service
            .create("u1", create(PlanType::ProMonthly, None))
            .await
            .unwrap();

        let payment = json!({ "event": "payment.success", "subscriptionId": "EXT-u1", "transactionId": "T-1" });
        store.fail_next_put.store(true, Ordering::SeqCst);
        assert!(matches!(
            deliver(&service, payment.clone()).await,
            Err(TollgateError::Persistence(_))
        ));
        assert!(service.payments("u1").await.unwrap().is_empty());

        // The gateway redelivers after the 500
        assert_eq!(
            deliver(&service, payment.clone()).await.unwrap(),
            WebhookOutcome::Applied {
                event: "payment.success",
                status: SubscriptionStatus::Active
            }
        );
        let view = service.status("u1").await.unwrap();
        assert!(view.is_pro);
        assert_eq!(service.payments("u1").await.unwrap().len(), 1);

        // Later redeliveries are still deduplicated
        assert!(matches!(
            deliver(&service, payment).await.unwrap(),
            WebhookOutcome::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_does_not_touch_replacement_subscription() {
        let store = Arc::new(MemoryStore::new());
        let racer = store.clone();
        let gateway = Arc::new(HookGateway {
            on_create: Box::new(|| {}),
            on_cancel: Box::new(move || pending_row(&racer, "u1", "EXT-replacement")),
            cancelled: Mutex::new(Vec::new()),
        });
        let mut gateways = GatewayRegistry::new();
        gateways.register(gateway.clone());
        let service =
            SubscriptionService::new(store.clone(), gateways, &SubscriptionConfig::default(), SECRET);

        let session = service
            .create("u1", create(PlanType::ProMonthly, None))
            .await
            .unwrap();
        deliver(
            &service,
            json!({ "event": "subscription.activated", "subscriptionId": session.external_id, "transactionId": "T-1" }),
        )
        .await
        .unwrap();

        assert!(matches!(
            service.cancel("u1").await,
            Err(TollgateError::Validation(_))
        ));
        assert_eq!(*gateway.cancelled.lock(), vec![session.external_id]);

        let sub = store.get_subscription("u1").await.unwrap().unwrap().value;
        assert_eq!(sub.subscription_id.as_deref(), Some("EXT-replacement"));
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.cancelled_at, None);
    }

    #[tokio::test]
    async fn test_losing_concurrent_checkout_is_abandoned() {
        let store = Arc::new(MemoryStore::new());
        let racer = store.clone();
        let gateway = Arc::new(HookGateway {
            on_create: Box::new(move || pending_row(&racer, "u1", "EXT-winner")),
            on_cancel: Box::new(|| {}),
            cancelled: Mutex::new(Vec::new()),
        });
        let mut gateways = GatewayRegistry::new();
        gateways.register(gateway.clone());
        let service =
            SubscriptionService::new(store.clone(), gateways, &SubscriptionConfig::default(), SECRET);

        let err = service
            .create("u1", create(PlanType::ProMonthly, None))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::Validation(_)));

        // The winner stays reachable for its webhooks; the loser was closed upstream
        let winner = store.find_by_subscription_id("EXT-winner").await.unwrap().unwrap();
        assert_eq!(winner.value.status, SubscriptionStatus::Pending);
        let cancelled = gateway.cancelled.lock().clone();
        assert_eq!(cancelled.len(), 1);
        assert_ne!(cancelled[0], "EXT-winner");
    }
}
