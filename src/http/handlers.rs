//! Route handlers for the attempt limiter and subscription endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn, Span};

use super::AppState;
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimitStatus;
use crate::store::Store;
use crate::subscription::CreateSubscription;

/// Body of the attempt limiter endpoints. Missing fields are reported as validation errors.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub action_type: String,
}

/// Read the user id the upstream auth layer put on the request.
fn authenticated_user<'a>(headers: &'a HeaderMap, header: &str) -> Result<&'a str> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TollgateError::Auth("no authenticated user".to_string()))
}

fn status_response(status: RateLimitStatus) -> Response {
    let code = if status.blocked {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

/// Log a rejection inside the handler span so it carries the request context.
fn rejected(err: impl Into<TollgateError>) -> TollgateError {
    let err = err.into();
    let status = err.status_code();
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %err, "Request failed");
    } else {
        warn!(status = status.as_u16(), error = %err, "Request rejected");
    }
    err
}

fn rate_limit_request(
    payload: std::result::Result<Json<RateLimitRequest>, JsonRejection>,
) -> Result<RateLimitRequest> {
    let Json(req) = payload.map_err(rejected)?;
    let span = Span::current();
    span.record("user_id", req.user_id.as_str());
    span.record("action_type", req.action_type.as_str());
    Ok(req)
}

fn user_from<'a>(headers: &'a HeaderMap, header: &str) -> Result<&'a str> {
    let user_id = authenticated_user(headers, header).map_err(rejected)?;
    Span::current().record("user_id", user_id);
    Ok(user_id)
}

#[instrument(skip_all, fields(user_id, action_type))]
pub async fn check_rate_limit<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    payload: std::result::Result<Json<RateLimitRequest>, JsonRejection>,
) -> Result<Response> {
    let req = rate_limit_request(payload)?;

    let status = state
        .rate_limiter
        .check(&req.user_id, &req.action_type)
        .await
        .map_err(rejected)?;

    debug!(
        attempts = status.attempts,
        blocked = status.blocked,
        "Rate limit checked"
    );
    Ok(status_response(status))
}

#[instrument(skip_all, fields(user_id, action_type))]
pub async fn increment_rate_limit<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    payload: std::result::Result<Json<RateLimitRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let req = rate_limit_request(payload)?;

    match state
        .rate_limiter
        .increment(&req.user_id, &req.action_type)
        .await
    {
        Ok(()) => Ok(Json(json!({ "success": true }))),
        Err(e @ TollgateError::Validation(_)) => Err(rejected(e)),
        Err(_) => {
            // Already logged by the limiter; the caller's action goes ahead
            Ok(Json(json!({ "success": false })))
        }
    }
}

#[instrument(skip_all, fields(user_id, action_type))]
pub async fn record_attempt<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    payload: std::result::Result<Json<RateLimitRequest>, JsonRejection>,
) -> Result<Response> {
    let req = rate_limit_request(payload)?;

    let status = state
        .rate_limiter
        .record_attempt(&req.user_id, &req.action_type)
        .await
        .map_err(rejected)?;
    Ok(status_response(status))
}

#[instrument(skip_all, fields(user_id, plan_type))]
pub async fn create_subscription<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateSubscription>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let user_id = user_from(&headers, &state.user_header)?;
    let Json(req) = payload.map_err(rejected)?;
    Span::current().record("plan_type", tracing::field::display(req.plan_type));

    let session = state
        .subscriptions
        .create(user_id, req)
        .await
        .map_err(rejected)?;
    Ok(Json(json!({
        "success": true,
        "paymentUrl": session.payment_url,
    })))
}

#[instrument(skip_all, fields(user_id))]
pub async fn cancel_subscription<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user_id = user_from(&headers, &state.user_header)?;

    state.subscriptions.cancel(user_id).await.map_err(rejected)?;
    Ok(Json(json!({
        "success": true,
        "message": "Subscription cancelled successfully",
    })))
}

#[instrument(skip_all, fields(user_id))]
pub async fn subscription_status<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Result<Response> {
    let user_id = user_from(&headers, &state.user_header)?;

    let view = state.subscriptions.status(user_id).await.map_err(rejected)?;
    Ok(Json(view).into_response())
}

#[instrument(skip_all, fields(user_id))]
pub async fn payment_history<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user_id = user_from(&headers, &state.user_header)?;

    let payments = state.subscriptions.payments(user_id).await.map_err(rejected)?;
    Ok(Json(json!({ "payments": payments })))
}

#[instrument(skip_all, fields(body_len = body.len()))]
pub async fn subscription_webhook<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());
    if signature.is_none() {
        warn!(header = %state.signature_header, "Webhook without signature header");
    }

    let outcome = state
        .subscriptions
        .handle_webhook(&body, signature)
        .await
        .map_err(rejected)?;
    info!(outcome = ?outcome, "Webhook received");
    Ok(Json(json!({ "received": true })))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
