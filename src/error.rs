//! Gateway error taxonomy and the OpenAI-compatible error envelope.
//!
//! Every gateway-originated failure renders as
//! `{"error": {"message", "type", "code"}}` with the HTTP status mapped from
//! the error kind. Handlers return `Result<T, GatewayError>` and propagate
//! with `?`; the [`IntoResponse`] impl takes care of the wire shape,
//! including the `Retry-After` header on rate-limit rejections.
//!
//! Anything unexpected converts through the transparent [`anyhow`] variant
//! into a 500 `internal_error` envelope — internals leak no further than the
//! message string.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// A gateway-originated request failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing or invalid API key. Provide via: Authorization: Bearer <key>")]
    InvalidApiKey,

    #[error("Rate limit exceeded: {current}/{limit} RPM. Retry after {retry_after}s.")]
    RateLimited {
        current: u32,
        limit: u32,
        /// Whole seconds until the oldest in-window request expires.
        retry_after: u64,
    },

    #[error("Token rate limit exceeded: {current}/{limit} TPM.")]
    TokenRateLimited { current: i64, limit: i64 },

    #[error("{0}")]
    BadRequest(String),

    #[error("No model specified and no default available")]
    ModelRequired,

    #[error("Model '{model}' not found. Available: {available:?}")]
    ModelNotFound { model: String, available: Vec<String> },

    #[error("{0}")]
    NotFound(String),

    #[error("Model backend '{0}' is currently unavailable. Please retry.")]
    BackendUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// `(status, error type, error code)` triple for the envelope.
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "invalid_request_error", "invalid_api_key")
            }
            Self::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "rate_limit_exceeded")
            }
            Self::TokenRateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "token_rate_limit_exceeded")
            }
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "bad_request"),
            Self::ModelRequired => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", "model_required")
            }
            Self::ModelNotFound { .. } => {
                (StatusCode::NOT_FOUND, "invalid_request_error", "model_not_found")
            }
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "invalid_request_error", "not_found"),
            Self::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", "backend_unavailable")
            }
            Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal_error")
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref e) = self {
            tracing::warn!(error = %e, "unhandled pipeline error");
        }

        let (status, error_type, code) = self.parts();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": code,
            }
        }));

        match self {
            Self::RateLimited { retry_after, .. } => {
                (status, [(header::RETRY_AFTER, retry_after.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
