//! Mapping service errors onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::TollgateError;

impl TollgateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TollgateError::Validation(_) => StatusCode::BAD_REQUEST,
            TollgateError::Auth(_) => StatusCode::UNAUTHORIZED,
            TollgateError::NotFound(_) => StatusCode::NOT_FOUND,
            TollgateError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            TollgateError::Gateway { .. } | TollgateError::Http(_) => StatusCode::BAD_GATEWAY,
            TollgateError::Persistence(_)
            | TollgateError::Conflict(_)
            | TollgateError::Config(_)
            | TollgateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handlers log rejections in their own span before returning them.
impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<JsonRejection> for TollgateError {
    fn from(rejection: JsonRejection) -> Self {
        TollgateError::Validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayKind;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            TollgateError::Validation(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TollgateError::Auth(String::new()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            TollgateError::RateLimited(String::new()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            TollgateError::Gateway {
                gateway: GatewayKind::PayIn,
                status: Some(500),
                body: String::new(),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TollgateError::Persistence(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
