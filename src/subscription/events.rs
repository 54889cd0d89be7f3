//! Webhook payload parsing.
//!
//! Gateways post a flat JSON object naming the event type. It is turned into
//! an exhaustive [`WebhookEvent`]; event types we do not handle are rejected.

use serde::Deserialize;

use crate::error::{Result, TollgateError};

/// Raw webhook body as posted by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(alias = "event_type", alias = "type")]
    event: String,
    #[serde(alias = "subscription_id")]
    subscription_id: String,
    #[serde(default, alias = "transaction_id")]
    transaction_id: Option<String>,
    #[serde(default, alias = "mandate_id")]
    mandate_id: Option<String>,
    #[serde(default, alias = "amount_inr", alias = "amount")]
    amount_inr: Option<u64>,
    #[serde(default, alias = "failure_reason")]
    reason: Option<String>,
}

/// A confirmed charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub transaction_id: Option<String>,
    pub amount_inr: Option<u64>,
}

/// A declined or failed charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentFailure {
    pub transaction_id: Option<String>,
    pub amount_inr: Option<u64>,
    pub reason: Option<String>,
}

/// Events that drive the subscription state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    SubscriptionActivated(PaymentReceipt),
    PaymentSucceeded(PaymentReceipt),
    PaymentFailed(PaymentFailure),
    SubscriptionCancelled,
    MandateRevoked,
    MandateCreated { mandate_id: String },
}

impl WebhookEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            WebhookEvent::SubscriptionActivated(_) => "subscription.activated",
            WebhookEvent::PaymentSucceeded(_) => "payment.success",
            WebhookEvent::PaymentFailed(_) => "payment.failed",
            WebhookEvent::SubscriptionCancelled => "subscription.cancelled",
            WebhookEvent::MandateRevoked => "mandate.revoked",
            WebhookEvent::MandateCreated { .. } => "mandate.created",
        }
    }

    /// Transaction reference used to deduplicate ledger writes.
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            WebhookEvent::SubscriptionActivated(receipt)
            | WebhookEvent::PaymentSucceeded(receipt) => receipt.transaction_id.as_deref(),
            WebhookEvent::PaymentFailed(failure) => failure.transaction_id.as_deref(),
            _ => None,
        }
    }
}

/// A parsed webhook: which subscription, and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEnvelope {
    pub subscription_id: String,
    pub event: WebhookEvent,
}

impl TryFrom<WebhookPayload> for WebhookEnvelope {
    type Error = TollgateError;

    fn try_from(payload: WebhookPayload) -> Result<Self> {
        if payload.subscription_id.trim().is_empty() {
            return Err(TollgateError::Validation(
                "subscriptionId is required".to_string(),
            ));
        }

        let event = match payload.event.as_str() {
            "subscription.activated" => WebhookEvent::SubscriptionActivated(PaymentReceipt {
                transaction_id: payload.transaction_id,
                amount_inr: payload.amount_inr,
            }),
            "payment.success" => WebhookEvent::PaymentSucceeded(PaymentReceipt {
                transaction_id: payload.transaction_id,
                amount_inr: payload.amount_inr,
            }),
            "payment.failed" => WebhookEvent::PaymentFailed(PaymentFailure {
                transaction_id: payload.transaction_id,
                amount_inr: payload.amount_inr,
                reason: payload.reason,
            }),
            "subscription.cancelled" => WebhookEvent::SubscriptionCancelled,
            "mandate.revoked" => WebhookEvent::MandateRevoked,
            "mandate.created" => {
                let mandate_id = payload.mandate_id.filter(|m| !m.is_empty()).ok_or_else(|| {
                    TollgateError::Validation("mandate.created requires mandateId".to_string())
                })?;
                WebhookEvent::MandateCreated { mandate_id }
            }
            other => {
                return Err(TollgateError::Validation(format!(
                    "Unsupported webhook event: {}",
                    other
                )))
            }
        };

        Ok(Self {
            subscription_id: payload.subscription_id,
            event,
        })
    }
}

/// Parse a raw webhook body.
pub fn parse_webhook(body: &[u8]) -> Result<WebhookEnvelope> {
    let payload: WebhookPayload = serde_json::from_slice(body)
        .map_err(|e| TollgateError::Validation(format!("Invalid webhook payload: {}", e)))?;
    WebhookEnvelope::try_from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payment_success() {
        let body = br#"{"event":"payment.success","subscriptionId":"I-ABC","transactionId":"T-1","amountInr":299}"#;
        let envelope = parse_webhook(body).unwrap();

        assert_eq!(envelope.subscription_id, "I-ABC");
        assert_eq!(
            envelope.event,
            WebhookEvent::PaymentSucceeded(PaymentReceipt {
                transaction_id: Some("T-1".to_string()),
                amount_inr: Some(299),
            })
        );
        assert_eq!(envelope.event.transaction_id(), Some("T-1"));
    }

    #[test]
    fn test_parse_snake_case_aliases() {
        let body = br#"{"event_type":"payment.failed","subscription_id":"I-ABC","failure_reason":"insufficient funds"}"#;
        let envelope = parse_webhook(body).unwrap();

        match envelope.event {
            WebhookEvent::PaymentFailed(failure) => {
                assert_eq!(failure.reason.as_deref(), Some("insufficient funds"));
                assert_eq!(failure.transaction_id, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let body = br#"{"event":"invoice.created","subscriptionId":"I-ABC"}"#;
        let err = parse_webhook(body).unwrap_err();
        assert!(err.to_string().contains("invoice.created"));
    }

    #[test]
    fn test_mandate_created_needs_id() {
        let body = br#"{"event":"mandate.created","subscriptionId":"I-ABC"}"#;
        assert!(parse_webhook(body).is_err());

        let body = br#"{"event":"mandate.created","subscriptionId":"I-ABC","mandateId":"M-9"}"#;
        assert_eq!(
            parse_webhook(body).unwrap().event,
            WebhookEvent::MandateCreated {
                mandate_id: "M-9".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_body_rejected() {
        assert!(matches!(
            parse_webhook(b"not json"),
            Err(TollgateError::Validation(_))
        ));
        assert!(matches!(
            parse_webhook(br#"{"event":"payment.success","subscriptionId":""}"#),
            Err(TollgateError::Validation(_))
        ));
    }
}
