//! Error types for the Tollgate service.

use thiserror::Error;

use crate::gateway::GatewayKind;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Missing or invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// No authenticated user, or an unverifiable webhook
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Subscription, user or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller exceeded an attempt threshold
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Upstream payment gateway failure
    #[error("{gateway} gateway error (status {status:?}): {body}")]
    Gateway {
        gateway: GatewayKind,
        status: Option<u16>,
        body: String,
    },

    /// Store unavailable or rejected the operation
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A conditional write lost against a concurrent writer
    #[error("Version conflict on {0}")]
    Conflict(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound HTTP errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Message safe to show an end user. Gateway and storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            TollgateError::Validation(msg)
            | TollgateError::NotFound(msg)
            | TollgateError::RateLimited(msg) => msg.clone(),
            TollgateError::Auth(_) => "Unauthorized".to_string(),
            TollgateError::Gateway { .. } | TollgateError::Http(_) => {
                "Payment provider request failed".to_string()
            }
            TollgateError::Persistence(_)
            | TollgateError::Conflict(_)
            | TollgateError::Config(_)
            | TollgateError::Io(_) => "Internal server error".to_string(),
        }
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
