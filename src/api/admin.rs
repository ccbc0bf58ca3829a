//! Admin API — operator-facing key management, usage queries, model status,
//! and session maintenance.
//!
//! Mounted under `/admin` on the same listener as the client API and gated
//! by [`crate::api::admin_auth`]. Responses are plain JSON, not the OpenAI
//! envelope, except for errors.

use std::{collections::HashSet, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    api::admin_auth,
    error::GatewayError,
    ledger,
    pipeline::Gateway,
    registry,
};

/// Build the admin router (nested under `/admin`).
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/admin/usage", get(global_usage))
        .route("/admin/usage/key/{api_key}", get(key_usage))
        .route("/admin/usage/model/{model}", get(model_usage))
        .route("/admin/usage/session/{session_id}", get(session_usage))
        .route("/admin/keys", get(list_keys).post(create_key))
        .route("/admin/keys/{api_key}", delete(revoke_key))
        .route("/admin/models", get(model_status))
        .route("/admin/models/reload", post(reload_models))
        .route("/admin/models/health", get(models_health))
        .route("/admin/sessions", get(list_all_sessions))
        .route("/admin/sessions/cleanup", post(force_cleanup))
        .route("/admin/tiering", get(tiering_config))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&gateway),
            admin_auth::admin_auth_middleware,
        ))
        .with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    #[serde(default = "default_since_hours")]
    since_hours: f64,
}

fn default_since_hours() -> f64 {
    24.0
}

impl SinceQuery {
    fn since(&self) -> f64 {
        ledger::now_epoch() - self.since_hours * 3600.0
    }
}

// ---------- Usage ----------

/// `GET /admin/usage?since_hours=N` — gateway-wide aggregate.
async fn global_usage(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Value>, GatewayError> {
    let stats = gateway.ledger.global(query.since())?;
    Ok(Json(json!({ "period_hours": query.since_hours, "stats": stats })))
}

/// `GET /admin/usage/key/{key}` — one key's aggregate plus per-model split.
async fn key_usage(
    State(gateway): State<Arc<Gateway>>,
    Path(api_key): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Value>, GatewayError> {
    let summary = gateway.ledger.by_key(&api_key, query.since())?;
    let by_model = gateway.ledger.breakdown(&api_key, query.since())?;
    Ok(Json(json!({
        "period_hours": query.since_hours,
        "summary": summary,
        "by_model": by_model,
    })))
}

/// `GET /admin/usage/model/{model}`.
async fn model_usage(
    State(gateway): State<Arc<Gateway>>,
    Path(model): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Value>, GatewayError> {
    let usage = gateway.ledger.by_model(&model, query.since())?;
    Ok(Json(json!({ "model": model, "period_hours": query.since_hours, "usage": usage })))
}

/// `GET /admin/usage/session/{id}`.
async fn session_usage(
    State(gateway): State<Arc<Gateway>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let usage = gateway.ledger.by_session(&session_id)?;
    Ok(Json(json!({ "session_id": session_id, "usage": usage })))
}

// ---------- Keys ----------

/// `GET /admin/keys` — masked records only.
async fn list_keys(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let keys = gateway.credentials.list_masked();
    Json(json!({ "count": keys.len(), "keys": keys }))
}

#[derive(Debug, Default, Deserialize)]
struct CreateKeyBody {
    key: Option<String>,
    owner: Option<String>,
    tier: Option<String>,
    rpm_limit: Option<u32>,
    tpm_limit: Option<i64>,
}

/// `POST /admin/keys` — mint (or replace) a key. This is the one place the
/// full key value is returned. The body is optional.
async fn create_key(
    State(gateway): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let body: CreateKeyBody = if body.is_empty() {
        CreateKeyBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| GatewayError::BadRequest("Invalid JSON body".into()))?
    };
    let key = body.key.unwrap_or_else(|| format!("gk-{}", Uuid::new_v4().simple()));
    let principal = gateway.credentials.add(
        &key,
        body.owner.as_deref().unwrap_or("unknown"),
        body.tier.as_deref().unwrap_or("standard"),
        body.rpm_limit.unwrap_or(gateway.settings.default_rpm),
        body.tpm_limit.unwrap_or(gateway.settings.default_tpm),
    )?;
    Ok(Json(json!({
        "key": principal.key,
        "owner": principal.owner,
        "tier": principal.tier,
        "rpm_limit": principal.rpm_limit,
        "tpm_limit": principal.tpm_limit,
    })))
}

/// `DELETE /admin/keys/{key}` — revoke (deactivate, never delete).
async fn revoke_key(
    State(gateway): State<Arc<Gateway>>,
    Path(api_key): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let revoked = gateway.credentials.revoke(&api_key)?;
    Ok(Json(json!({ "revoked": revoked })))
}

// ---------- Models ----------

/// `GET /admin/models` — full backend descriptors.
async fn model_status(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let models = gateway.registry.list();
    Json(json!({ "count": models.len(), "models": &*models }))
}

/// `POST /admin/models/reload` — explicit catalog reload. Unlike the mtime
/// watcher this reports failures to the caller; the live registry is left
/// untouched either way.
async fn reload_models(State(gateway): State<Arc<Gateway>>) -> Result<Json<Value>, GatewayError> {
    let count = registry::load_and_install(
        &gateway.settings.models_config,
        &gateway.registry,
        &gateway.tiering,
    )?;
    Ok(Json(json!({ "reloaded": true, "model_count": count })))
}

/// `GET /admin/models/health` — probe each distinct backend URL.
async fn models_health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let mut probed = HashSet::new();
    let mut backends = Vec::new();
    for model in gateway.registry.list().iter() {
        if !probed.insert(model.backend_url.clone()) {
            continue;
        }
        match gateway.upstream.probe(&model.backend_url).await {
            Ok(()) => backends.push(json!({ "backend_url": model.backend_url, "status": "ok" })),
            Err(e) => backends.push(json!({
                "backend_url": model.backend_url,
                "status": "unreachable",
                "error": e.to_string(),
            })),
        }
    }

    let all_ok = backends.iter().all(|b| b["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };
    (status, Json(json!({ "backends": backends })))
}

// ---------- Sessions ----------

/// `GET /admin/sessions` — all live sessions, any key.
async fn list_all_sessions(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let sessions = gateway.sessions.list(None);
    Json(json!({ "active_count": sessions.len(), "sessions": sessions }))
}

/// `POST /admin/sessions/cleanup` — force an expiry sweep.
async fn force_cleanup(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let removed = gateway.sessions.cleanup_expired();
    Json(json!({ "removed": removed, "remaining": gateway.sessions.active_count() }))
}

// ---------- Tiering ----------

/// `GET /admin/tiering` — the live tiering config (patterns included).
async fn tiering_config(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let snapshot = gateway.tiering.snapshot();
    Json(json!(&*snapshot))
}
