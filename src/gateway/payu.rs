//! PayU hosted checkout. One-off payments, so there is nothing to cancel upstream.

use async_trait::async_trait;
use reqwest::Url;
use tracing::debug;

use super::{CheckoutRequest, CheckoutSession, GatewayKind, PaymentGateway};
use crate::config::PayUConfig;
use crate::error::{Result, TollgateError};

pub struct PayUGateway {
    config: PayUConfig,
}

impl PayUGateway {
    pub fn new(config: PayUConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PaymentGateway for PayUGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PayU
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let params = &request.params;
        let amount = request.amount_inr.to_string();
        let plan = request.plan.to_string();

        let mut query: Vec<(&str, &str)> = vec![
            ("key", self.config.merchant_key.as_str()),
            ("txnid", request.reference.as_str()),
            ("amount", amount.as_str()),
            ("productinfo", plan.as_str()),
            ("udf1", request.user_id.as_str()),
        ];
        let optional: [(&str, Option<&String>); 5] = [
            ("firstname", params.customer_name.as_ref()),
            ("email", params.customer_email.as_ref()),
            ("phone", params.customer_phone.as_ref()),
            ("surl", params.return_url.as_ref()),
            ("furl", params.cancel_url.as_ref()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                query.push((name, value.as_str()));
            }
        }

        let url = Url::parse_with_params(&self.config.checkout_url, &query)
            .map_err(|e| TollgateError::Config(format!("Invalid PayU checkout URL: {}", e)))?;

        debug!(txnid = %request.reference, "PayU checkout prepared");
        Ok(CheckoutSession {
            payment_url: url.into(),
            external_id: request.reference.clone(),
        })
    }

    async fn cancel(&self, external_id: &str, _reason: &str) -> Result<()> {
        debug!(txnid = %external_id, "PayU has no recurring billing to cancel");
        Ok(())
    }
}
