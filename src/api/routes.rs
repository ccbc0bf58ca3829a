//! Client-facing API — the endpoints agents talk to.
//!
//! Handlers are deliberately thin: the completion path delegates to
//! [`crate::pipeline`], session CRUD to the [`crate::sessions`] store. Every
//! `/v1/*` route requires a valid bearer key; `/health` does not.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    auth,
    error::GatewayError,
    pipeline::{self, Gateway},
    sessions::{ChatMessage, Role},
};

/// Build the client-facing router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/sessions", get(list_sessions).post(create_session))
        .route("/v1/sessions/{session_id}", get(get_session).delete(delete_session))
        .with_state(gateway)
}

/// `GET /health` — gateway liveness plus store counts. Unauthenticated.
async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "models": gateway.registry.model_count(),
        "api_keys": gateway.credentials.key_count(),
    }))
}

/// `GET /v1/models` — registered models in OpenAI list format.
async fn list_models(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    auth::authenticate(&gateway.credentials, &headers)?;
    let data: Vec<Value> = gateway
        .registry
        .list()
        .iter()
        .map(|m| {
            json!({
                "id": m.name,
                "object": "model",
                "created": 0,
                "owned_by": m.provider,
                "permission": [],
                "root": m.model_id,
                "parent": null,
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

/// `POST /v1/chat/completions` — the pipeline entry point.
async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match pipeline::handle_chat_completion(&gateway, &headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// `GET /v1/sessions` — live sessions owned by the calling key.
async fn list_sessions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let (api_key, _) = auth::authenticate(&gateway.credentials, &headers)?;
    let sessions = gateway.sessions.list(Some(&api_key));
    Ok(Json(json!({ "count": sessions.len(), "sessions": sessions })))
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionBody {
    session_id: Option<String>,
    metadata: Option<Map<String, Value>>,
    system_message: Option<String>,
}

/// `POST /v1/sessions` — create (or touch) a session, optionally seeding
/// metadata and a system message. The body is optional.
async fn create_session(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let (api_key, _) = auth::authenticate(&gateway.credentials, &headers)?;

    let body: CreateSessionBody = if body.is_empty() {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| GatewayError::BadRequest("Invalid JSON body".into()))?
    };

    let session_id = body
        .session_id
        .unwrap_or_else(|| format!("sess-{}", &Uuid::new_v4().simple().to_string()[..16]));
    let session = gateway.sessions.get_or_create(&session_id, &api_key);

    if let Some(metadata) = body.metadata {
        gateway.sessions.merge_metadata(&session_id, metadata);
    }
    if let Some(system_message) = body.system_message {
        gateway
            .sessions
            .append(&session_id, vec![ChatMessage::text(Role::System, system_message)]);
    }

    let session = gateway.sessions.get(&session_id).unwrap_or(session);
    Ok(Json(json!({
        "session_id": session.session_id,
        "created_at": session.created_at.timestamp_millis() as f64 / 1000.0,
        "metadata": session.metadata,
    })))
}

/// `GET /v1/sessions/{id}` — session details including full history.
async fn get_session(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    auth::authenticate(&gateway.credentials, &headers)?;
    let session = gateway
        .sessions
        .get(&session_id)
        .ok_or_else(|| GatewayError::NotFound(format!("Session '{session_id}' not found")))?;

    Ok(Json(json!({
        "session_id": session.session_id,
        "message_count": session.messages.len(),
        "messages": session.messages,
        "created_at": session.created_at.timestamp_millis() as f64 / 1000.0,
        "last_accessed": session.last_accessed.timestamp_millis() as f64 / 1000.0,
        "metadata": session.metadata,
    })))
}

/// `DELETE /v1/sessions/{id}`.
async fn delete_session(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    auth::authenticate(&gateway.credentials, &headers)?;
    let deleted = gateway.sessions.delete(&session_id);
    Ok(Json(json!({ "deleted": deleted, "session_id": session_id })))
}
