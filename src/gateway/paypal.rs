//! PayPal subscriptions over the REST API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ensure_success, CheckoutRequest, CheckoutSession, GatewayKind, PaymentGateway};
use crate::config::PayPalConfig;
use crate::error::{Result, TollgateError};
use crate::subscription::PlanType;

/// Tokens are refreshed this long before PayPal says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct PayPalGateway {
    http: reqwest::Client,
    config: PayPalConfig,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalGateway {
    pub fn new(http: reqwest::Client, config: PayPalConfig) -> Self {
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// OAuth2 client-credentials token, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String> {
        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|t| t.expires_at > Utc::now())
            .map(|t| t.value.clone());
        if let Some(value) = cached {
            return Ok(value);
        }

        debug!("Requesting PayPal access token");
        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = ensure_success(GatewayKind::PayPal, response)
            .await?
            .json()
            .await?;

        let lifetime = (token.expires_in - TOKEN_REFRESH_MARGIN_SECS).max(0);
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        });
        Ok(token.access_token)
    }

    fn plan_id(&self, plan: PlanType) -> Result<&str> {
        match plan {
            PlanType::ProMonthly => Ok(&self.config.plan_monthly),
            PlanType::ProYearly => Ok(&self.config.plan_yearly),
            PlanType::Free => Err(TollgateError::Validation(
                "The free plan has no checkout".to_string(),
            )),
        }
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PayPal
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let token = self.access_token().await?;
        let return_url = request
            .params
            .return_url
            .as_deref()
            .unwrap_or(&self.config.return_url);
        let cancel_url = request
            .params
            .cancel_url
            .as_deref()
            .unwrap_or(&self.config.cancel_url);

        let body = json!({
            "plan_id": self.plan_id(request.plan)?,
            "custom_id": request.reference,
            "application_context": {
                "user_action": "SUBSCRIBE_NOW",
                "return_url": return_url,
                "cancel_url": cancel_url,
            },
        });

        let response = self
            .http
            .post(self.url("/v1/billing/subscriptions"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let created: SubscriptionResponse = ensure_success(GatewayKind::PayPal, response)
            .await?
            .json()
            .await?;

        let approve = created
            .links
            .into_iter()
            .find(|link| link.rel == "approve")
            .ok_or_else(|| TollgateError::Gateway {
                gateway: GatewayKind::PayPal,
                status: None,
                body: format!("subscription {} has no approve link", created.id),
            })?;

        info!(
            user_id = %request.user_id,
            subscription_id = %created.id,
            "PayPal subscription created"
        );
        Ok(CheckoutSession {
            payment_url: approve.href,
            external_id: created.id,
        })
    }

    async fn cancel(&self, external_id: &str, reason: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(&format!("/v1/billing/subscriptions/{}/cancel", external_id)))
            .bearer_auth(token)
            .json(&json!({ "reason": reason }))
            .send()
            .await?;
        ensure_success(GatewayKind::PayPal, response).await?;

        info!(subscription_id = %external_id, "PayPal subscription cancelled");
        Ok(())
    }
}
