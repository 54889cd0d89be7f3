//! Pay.in autopay mandates.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ensure_success, CheckoutRequest, CheckoutSession, GatewayKind, PaymentGateway};
use crate::config::PayInConfig;
use crate::error::{Result, TollgateError};
use crate::subscription::PlanType;

#[derive(Debug, Deserialize)]
struct MandateResponse {
    mandate_id: String,
    authorization_url: String,
}

pub struct PayInGateway {
    http: reqwest::Client,
    config: PayInConfig,
}

impl PayInGateway {
    pub fn new(http: reqwest::Client, config: PayInConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

fn frequency(plan: PlanType) -> Result<&'static str> {
    match plan {
        PlanType::ProMonthly => Ok("monthly"),
        PlanType::ProYearly => Ok("yearly"),
        PlanType::Free => Err(TollgateError::Validation(
            "The free plan has no checkout".to_string(),
        )),
    }
}

#[async_trait]
impl PaymentGateway for PayInGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PayIn
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let body = json!({
            "reference": request.reference,
            "amount_inr": request.amount_inr,
            "frequency": frequency(request.plan)?,
            "return_url": request.params.return_url,
            "customer": {
                "name": request.params.customer_name,
                "email": request.params.customer_email,
                "phone": request.params.customer_phone,
            },
        });

        let response = self
            .http
            .post(self.url("/v1/mandates"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let mandate: MandateResponse = ensure_success(GatewayKind::PayIn, response)
            .await?
            .json()
            .await?;

        info!(
            user_id = %request.user_id,
            mandate_id = %mandate.mandate_id,
            "Autopay mandate requested"
        );
        Ok(CheckoutSession {
            payment_url: mandate.authorization_url,
            external_id: mandate.mandate_id,
        })
    }

    async fn cancel(&self, external_id: &str, reason: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/v1/mandates/{}/cancel", external_id)))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "reason": reason }))
            .send()
            .await?;
        ensure_success(GatewayKind::PayIn, response).await?;

        info!(mandate_id = %external_id, "Autopay mandate cancelled");
        Ok(())
    }
}
