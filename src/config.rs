//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Result, TollgateError};
use crate::gateway::GatewayKind;

/// Prefix for environment variable overrides, e.g. `TOLLGATE__WEBHOOK__SECRET`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Attempt limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Subscription lifecycle configuration
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// Webhook verification
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Payment gateway credentials and endpoints
    #[serde(default)]
    pub gateways: GatewaysConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Header carrying the authenticated user id, set by the upstream auth layer
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            user_header: default_user_header(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

/// Attempt limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Attempts allowed before the pair is locked out
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout window in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// Conditional write retries before giving up on a contended row
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_secs: default_lockout_secs(),
            max_write_retries: default_max_write_retries(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lockout_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_write_retries() -> u32 {
    5
}

/// Subscription lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Failed payments tolerated before the subscription expires
    #[serde(default = "default_max_payment_retries")]
    pub max_payment_retries: u32,

    /// Days of pro access retained after a failed payment
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,

    /// Age after which an unconfirmed pending subscription is reverted
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,

    /// How often the pending reconciliation runs
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Gateway used when a create request does not name one
    #[serde(default = "default_gateway")]
    pub default_gateway: GatewayKind,

    #[serde(default = "default_price_monthly_inr")]
    pub price_monthly_inr: u64,

    #[serde(default = "default_price_yearly_inr")]
    pub price_yearly_inr: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_payment_retries: default_max_payment_retries(),
            grace_period_days: default_grace_period_days(),
            pending_ttl_secs: default_pending_ttl_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            default_gateway: default_gateway(),
            price_monthly_inr: default_price_monthly_inr(),
            price_yearly_inr: default_price_yearly_inr(),
        }
    }
}

fn default_max_payment_retries() -> u32 {
    3
}

fn default_grace_period_days() -> i64 {
    3
}

fn default_pending_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_reconcile_interval_secs() -> u64 {
    15 * 60
}

fn default_gateway() -> GatewayKind {
    GatewayKind::PayPal
}

fn default_price_monthly_inr() -> u64 {
    299
}

fn default_price_yearly_inr() -> u64 {
    2999
}

/// Webhook verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC-SHA256 secret
    #[serde(default)]
    pub secret: String,

    /// Header carrying the hex-encoded signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            signature_header: default_signature_header(),
        }
    }
}

fn default_signature_header() -> String {
    "x-webhook-signature".to_string()
}

/// Payment gateway configuration. A gateway without credentials is not registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaysConfig {
    #[serde(default)]
    pub paypal: Option<PayPalConfig>,

    #[serde(default)]
    pub payin: Option<PayInConfig>,

    #[serde(default)]
    pub payu: Option<PayUConfig>,
}

/// PayPal REST configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalConfig {
    #[serde(default = "default_paypal_base_url")]
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Billing plan id for pro_monthly
    pub plan_monthly: String,
    /// Billing plan id for pro_yearly
    pub plan_yearly: String,
    pub return_url: String,
    pub cancel_url: String,
}

fn default_paypal_base_url() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}

/// Pay.in autopay mandate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInConfig {
    pub base_url: String,
    pub api_key: String,
}

/// PayU hosted checkout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayUConfig {
    #[serde(default = "default_payu_checkout_url")]
    pub checkout_url: String,
    pub merchant_key: String,
}

fn default_payu_checkout_url() -> String {
    "https://test.payu.in/_payment".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the state machines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.max_attempts == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limiting.lockout_secs == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.lockout_secs must be positive".to_string(),
            ));
        }
        if self.subscription.max_payment_retries == 0 {
            return Err(TollgateError::Config(
                "subscription.max_payment_retries must be at least 1".to_string(),
            ));
        }
        if self.subscription.reconcile_interval_secs == 0 {
            return Err(TollgateError::Config(
                "subscription.reconcile_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
