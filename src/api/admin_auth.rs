//! Bearer-token gate for the admin API.
//!
//! When `GONKA_ADMIN_API_KEY` is set, every `/admin/*` request must carry it
//! as `Authorization: Bearer <key>`. When unset the gate is a no-op — dev
//! convenience, acceptable only when the gateway is not reachable from
//! untrusted networks.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{auth, error::GatewayError, pipeline::Gateway};

/// Axum middleware enforcing the admin bearer token when configured.
pub async fn admin_auth_middleware(
    State(gateway): State<Arc<Gateway>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &gateway.settings.admin_api_key else {
        return next.run(req).await;
    };

    match auth::extract_bearer(req.headers()) {
        Ok(provided) if provided == expected.as_str() => next.run(req).await,
        _ => GatewayError::InvalidApiKey.into_response(),
    }
}
