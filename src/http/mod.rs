//! HTTP API for the attempt limiter and subscription lifecycle.

mod error;
mod handlers;
mod server;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::ratelimit::RateLimiter;
use crate::store::Store;
use crate::subscription::SubscriptionService;

pub use handlers::RateLimitRequest;
pub use server::HttpServer;

/// Shared state behind every route.
pub struct AppState<S> {
    pub rate_limiter: RateLimiter<S>,
    pub subscriptions: Arc<SubscriptionService<S>>,
    /// Header carrying the authenticated user id
    pub user_header: String,
    /// Header carrying the webhook HMAC
    pub signature_header: String,
}

/// Build the API router.
pub fn router<S: Store + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/api/check-rate-limit", post(handlers::check_rate_limit::<S>))
        .route(
            "/api/increment-rate-limit",
            post(handlers::increment_rate_limit::<S>),
        )
        .route("/api/record-attempt", post(handlers::record_attempt::<S>))
        .route(
            "/api/subscription/create",
            post(handlers::create_subscription::<S>),
        )
        .route(
            "/api/subscription/cancel",
            post(handlers::cancel_subscription::<S>),
        )
        .route(
            "/api/subscription/status",
            get(handlers::subscription_status::<S>),
        )
        .route(
            "/api/subscription/payments",
            get(handlers::payment_history::<S>),
        )
        .route(
            "/api/subscription/webhook",
            post(handlers::subscription_webhook::<S>),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
}
