//! Payment gateway clients.

mod payin;
mod paypal;
mod payu;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GatewaysConfig;
use crate::error::{Result, TollgateError};
use crate::subscription::PlanType;

pub use payin::PayInGateway;
pub use paypal::PayPalGateway;
pub use payu::PayUGateway;

/// Supported payment gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    PayPal,
    PayU,
    /// Autopay mandate gateway
    PayIn,
}

impl GatewayKind {
    /// Whether the gateway keeps its own recurring subscription that must be
    /// cancelled before the local row.
    pub fn has_recurring_billing(&self) -> bool {
        matches!(self, GatewayKind::PayPal | GatewayKind::PayIn)
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GatewayKind::PayPal => "paypal",
            GatewayKind::PayU => "payu",
            GatewayKind::PayIn => "payin",
        };
        f.write_str(name)
    }
}

/// Customer details some gateways want at checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutParams {
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
}

/// Everything a gateway needs to open a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub plan: PlanType,
    pub amount_inr: u64,
    /// Local reference the gateway echoes back
    pub reference: String,
    pub params: CheckoutParams,
}

/// An opened checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    /// Where to send the user
    pub payment_url: String,
    /// Id the gateway will use in webhooks
    pub external_id: String,
}

/// A payment gateway capable of opening checkouts and cancelling recurring billing.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession>;

    /// Cancel recurring billing at the gateway.
    async fn cancel(&self, external_id: &str, reason: &str) -> Result<()>;
}

/// Turn a non-success gateway response into an error carrying the body for the logs.
pub(crate) async fn ensure_success(
    gateway: GatewayKind,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        gateway = %gateway,
        status = status.as_u16(),
        body = %body,
        "Gateway request failed"
    );
    Err(TollgateError::Gateway {
        gateway,
        status: Some(status.as_u16()),
        body,
    })
}

/// Configured gateways, by kind.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every gateway that has configuration.
    pub fn from_config(config: &GatewaysConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let mut registry = Self::new();
        if let Some(ref paypal) = config.paypal {
            registry.register(Arc::new(PayPalGateway::new(http.clone(), paypal.clone())));
        }
        if let Some(ref payin) = config.payin {
            registry.register(Arc::new(PayInGateway::new(http.clone(), payin.clone())));
        }
        if let Some(ref payu) = config.payu {
            registry.register(Arc::new(PayUGateway::new(payu.clone())));
        }
        Ok(registry)
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        info!(gateway = %gateway.kind(), "Payment gateway registered");
        self.gateways.insert(gateway.kind(), gateway);
    }

    pub fn get(&self, kind: GatewayKind) -> Result<Arc<dyn PaymentGateway>> {
        self.gateways.get(&kind).cloned().ok_or_else(|| {
            TollgateError::Validation(format!("Payment gateway {} is not available", kind))
        })
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
