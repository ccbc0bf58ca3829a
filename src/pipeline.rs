//! The request pipeline — the orchestrator behind `/v1/chat/completions`.
//!
//! Each call walks the same ladder: bearer auth → RPM and TPM windows →
//! body parse → tiering + registry resolution → optional session merge →
//! upstream forward → (streamed or buffered) response → metering. Validation
//! failures surface immediately as OpenAI-style error envelopes; metering
//! and session-append failures are logged and swallowed so a storage hiccup
//! never turns a successful completion into a client-visible error.
//!
//! All shared stores are owned by [`Gateway`] and borrowed for the duration
//! of a call — handlers receive the single `Arc<Gateway>` handle via axum
//! state.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

use crate::{
    auth::{self, CredentialStore},
    error::GatewayError,
    ledger::{self, UsageLedger, UsageRecord},
    rate_limit::RateLimiter,
    registry::ModelRegistry,
    relay,
    sessions::{ChatMessage, SessionStore},
    settings::Settings,
    tiering::TieringResolver,
    upstream::UpstreamClient,
};

/// All shared state, owned in one place and dependency-injected into
/// handlers as `Arc<Gateway>`.
pub struct Gateway {
    pub settings: Settings,
    pub registry: ModelRegistry,
    pub tiering: TieringResolver,
    pub credentials: CredentialStore,
    pub limiter: RateLimiter,
    pub sessions: SessionStore,
    pub ledger: UsageLedger,
    pub upstream: UpstreamClient,
}

impl Gateway {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let credentials = CredentialStore::load(settings.api_keys_file.clone())?;
        let ledger = UsageLedger::open(settings.usage_db_path())?;
        let sessions = SessionStore::new(settings.session_ttl, settings.session_max_history);
        Ok(Self {
            registry: ModelRegistry::new(),
            tiering: TieringResolver::new(),
            credentials,
            limiter: RateLimiter::new(),
            sessions,
            ledger,
            upstream: UpstreamClient::new(),
            settings,
        })
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
}

/// Drive one chat-completion call through the full pipeline.
pub async fn handle_chat_completion(
    gateway: &Arc<Gateway>,
    headers: &HeaderMap,
    raw_body: Bytes,
) -> Result<Response, GatewayError> {
    let started = Instant::now();

    let (api_key, principal) = auth::authenticate(&gateway.credentials, headers)?;
    gateway.limiter.check_request(&api_key, principal.rpm_limit)?;
    gateway.limiter.check_tokens(&api_key, principal.tpm_limit)?;

    let mut body: Value = serde_json::from_slice(&raw_body)
        .map_err(|_| GatewayError::BadRequest("Invalid JSON body".into()))?;
    if !body.is_object() {
        return Err(GatewayError::BadRequest("Request body must be a JSON object".into()));
    }

    let messages: Vec<ChatMessage> = match body.get("messages") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| GatewayError::BadRequest("Malformed `messages` array".into()))?,
        None => Vec::new(),
    };

    // Tiering first, registry lookup second.
    let requested_model = body.get("model").and_then(Value::as_str).unwrap_or("");
    let tier_hint = header_str(headers, "x-gonka-tier");
    let mut model_name = gateway.tiering.resolve(&messages, requested_model, tier_hint);
    if model_name.is_empty() {
        model_name = gateway.registry.default_model().ok_or(GatewayError::ModelRequired)?;
    }
    let backend = gateway.registry.resolve(&model_name)?;

    // Session merge. Messages are rewritten only when a session is in play;
    // otherwise the client body passes through byte-for-byte apart from the
    // model field.
    let session_id = header_str(headers, "x-gonka-session-id").map(str::to_string);
    if let Some(sid) = &session_id {
        gateway.sessions.get_or_create(sid, &api_key);
        let merged = gateway.sessions.inject_history(sid, &messages);
        body["messages"] =
            serde_json::to_value(merged).map_err(|e| GatewayError::Internal(e.into()))?;
    }
    body["model"] = Value::String(backend.model_id.clone());

    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    tracing::debug!(model = %model_name, backend = %backend.backend_url, streaming, "forwarding");

    let upstream_response = gateway
        .upstream
        .chat_completions(&backend.backend_url, &body)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, model = %model_name, "upstream request failed");
            GatewayError::BackendUnavailable(model_name.clone())
        })?;

    let status = upstream_response.status();
    if status != StatusCode::OK {
        // Upstream rejections pass through verbatim, same status and body.
        let bytes = upstream_response
            .bytes()
            .await
            .map_err(|_| GatewayError::BackendUnavailable(model_name.clone()))?;
        return Ok((status, [("content-type", "application/json")], bytes).into_response());
    }

    if streaming {
        let gateway = Arc::clone(gateway);
        let model = model_name.clone();
        let on_complete = move |total_tokens: i64| {
            // Input token counts are not available on the streaming path.
            meter(&gateway, &api_key, &model, 0, total_tokens, total_tokens, started, session_id.as_deref());
        };
        return Ok(relay::sse_response(upstream_response, model_name, on_complete));
    }

    let result: Value = upstream_response.json().await.map_err(|e| {
        GatewayError::Internal(anyhow::Error::new(e).context("parsing upstream response body"))
    })?;

    let usage = result.get("usage");
    let token = |field: &str| {
        usage.and_then(|u| u.get(field)).and_then(Value::as_i64).unwrap_or(0)
    };
    meter(
        gateway,
        &api_key,
        &model_name,
        token("prompt_tokens"),
        token("completion_tokens"),
        token("total_tokens"),
        started,
        session_id.as_deref(),
    );

    // Persist the new turn: the client's latest message plus the assistant
    // reply. Best-effort, like all post-call bookkeeping.
    if let Some(sid) = &session_id {
        let mut turn: Vec<ChatMessage> = messages.last().cloned().into_iter().collect();
        if let Some(reply) = result.pointer("/choices/0/message") {
            match serde_json::from_value::<ChatMessage>(reply.clone()) {
                Ok(message) => turn.push(message),
                Err(e) => tracing::warn!(error = %e, "assistant reply not appendable to session"),
            }
        }
        gateway.sessions.append(sid, turn);
    }

    Ok((StatusCode::OK, Json(result)).into_response())
}

/// Write the usage row and feed the TPM window. Failures are logged, never
/// surfaced — metering must not break a completed call.
#[allow(clippy::too_many_arguments)]
fn meter(
    gateway: &Gateway,
    api_key: &str,
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    started: Instant,
    session_id: Option<&str>,
) {
    let record = UsageRecord {
        api_key: api_key.to_string(),
        model: model.to_string(),
        input_tokens,
        output_tokens,
        total_tokens,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        session_id: session_id.map(str::to_string),
        timestamp: ledger::now_epoch(),
    };
    if let Err(e) = gateway.ledger.record(&record) {
        tracing::warn!(error = %e, "usage record write failed");
    }
    gateway.limiter.record_tokens(api_key, total_tokens);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelBackend;
    use crate::sessions::Role;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "gk-test-key-000000000000";

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: Arc<Gateway>,
        app: axum::Router,
    }

    fn fixture_with_limits(upstream_url: &str, rpm: u32, tpm: i64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            gateway_host: "127.0.0.1".into(),
            gateway_port: 0,
            models_config: dir.path().join("models.toml"),
            api_keys_file: None,
            admin_api_key: None,
            default_rpm: 60,
            default_tpm: 100_000,
            session_ttl: Duration::from_secs(3600),
            session_max_history: 100,
            data_dir: dir.path().to_path_buf(),
        };
        let gateway = Gateway::new(settings).unwrap();
        gateway.credentials.add(KEY, "tests", "standard", rpm, tpm).unwrap();
        gateway.registry.install(vec![ModelBackend {
            name: "m1".into(),
            display_name: "Model One".into(),
            provider: "vllm".into(),
            model_id: "org/m1-instruct".into(),
            tier: "standard".into(),
            backend_url: upstream_url.into(),
            capabilities: vec!["chat".into()],
            context_length: 4096,
            pricing: Default::default(),
        }]);
        let gateway = Arc::new(gateway);
        let app = crate::api::router(Arc::clone(&gateway));
        Fixture { _dir: dir, gateway, app }
    }

    fn fixture(upstream_url: &str) -> Fixture {
        fixture_with_limits(upstream_url, 60, 100_000)
    }

    fn completion_request(body: Value) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ok_upstream_body() -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        })
    }

    async fn mock_upstream(body: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn missing_bearer_is_rejected_with_401() {
        let f = fixture("http://127.0.0.1:9");
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(json!({"model": "m1", "messages": []}).to_string()))
            .unwrap();
        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "invalid_api_key");
    }

    #[tokio::test]
    async fn revoked_key_is_rejected_with_401() {
        let f = fixture("http://127.0.0.1:9");
        f.gateway.credentials.revoke(KEY).unwrap();
        let response =
            f.app.oneshot(completion_request(json!({"model": "m1", "messages": []}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // -----------------------------------------------------------------------
    // Parsing and model resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_json_body_is_a_400_bad_request() {
        let f = fixture("http://127.0.0.1:9");
        let request = Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn unknown_model_is_a_404_listing_available_names() {
        let f = fixture("http://127.0.0.1:9");
        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "ghost", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "model_not_found");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("ghost") && message.contains("m1"), "got: {message}");
    }

    #[tokio::test]
    async fn missing_model_falls_back_to_the_registry_default() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());
        let response = f
            .app
            .oneshot(completion_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The forwarded body carries the backend's upstream id.
        let sent: Value =
            serde_json::from_slice(&server.received_requests().await.unwrap()[0].body).unwrap();
        assert_eq!(sent["model"], "org/m1-instruct");
    }

    #[tokio::test]
    async fn missing_model_with_empty_registry_is_model_required() {
        let f = fixture("http://127.0.0.1:9");
        f.gateway.registry.install(vec![]);
        let response = f
            .app
            .oneshot(completion_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "model_required");
    }

    #[tokio::test]
    async fn tier_hint_header_rewrites_the_target_model() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());
        // Point the reasoning tier at m1 so the hint resolves.
        f.gateway.tiering.install(
            crate::tiering::TieringConfig::compile(&crate::tiering::TieringSection {
                reasoning_model: "m1".into(),
                ..Default::default()
            })
            .unwrap(),
        );

        let request = Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .header("x-gonka-tier", "reasoning")
            .body(Body::from(
                json!({"model": "ghost", "messages": [{"role": "user", "content": "hi"}]})
                    .to_string(),
            ))
            .unwrap();
        // "ghost" is unknown, but the hint outranks the requested model.
        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -----------------------------------------------------------------------
    // Happy path + metering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn happy_path_returns_upstream_body_and_writes_one_ledger_row() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());

        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, ok_upstream_body());

        let usage = f.gateway.ledger.by_key(KEY, 0.0).unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.total_input, 3);
        assert_eq!(usage.total_output, 1);
        assert_eq!(usage.total_tokens, 4);
        assert!(usage.avg_latency_ms >= 0.0);

        let by_model = f.gateway.ledger.by_model("m1", 0.0).unwrap();
        assert_eq!(by_model.request_count, 1);
        assert_eq!(by_model.total_tokens, 4);
    }

    #[tokio::test]
    async fn missing_usage_block_records_zeros() {
        let server =
            mock_upstream(json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]}))
                .await;
        let f = fixture(&server.uri());

        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let usage = f.gateway.ledger.by_key(KEY, 0.0).unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn non_stream_fields_pass_through_to_the_backend() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());
        f.app
            .oneshot(completion_request(json!({
                "model": "m1",
                "messages": [{"role": "user", "content": "hi"}],
                "temperature": 0.2,
                "max_tokens": 128,
                "tools": [{"type": "function", "function": {"name": "f"}}]
            })))
            .await
            .unwrap();

        let sent: Value =
            serde_json::from_slice(&server.received_requests().await.unwrap()[0].body).unwrap();
        assert_eq!(sent["temperature"], 0.2);
        assert_eq!(sent["max_tokens"], 128);
        assert_eq!(sent["tools"][0]["function"]["name"], "f");
        // No session header: the messages array is untouched.
        assert_eq!(sent["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    // -----------------------------------------------------------------------
    // Upstream failure handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unreachable_backend_is_a_503_backend_unavailable() {
        let f = fixture("http://127.0.0.1:9");
        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "backend_unavailable");
        assert!(body["error"]["message"].as_str().unwrap().contains("'m1'"));
    }

    #[tokio::test]
    async fn upstream_non_200_passes_through_status_and_body() {
        let server = MockServer::start().await;
        let upstream_error = json!({"error": {"message": "context length exceeded",
                                              "type": "invalid_request_error", "code": null}});
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(422).set_body_json(upstream_error.clone()))
            .mount(&server)
            .await;
        let f = fixture(&server.uri());

        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await, upstream_error);

        // A failed call is not metered.
        assert_eq!(f.gateway.ledger.by_key(KEY, 0.0).unwrap().request_count, 0);
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sixth_through_tenth_requests_get_429_with_retry_after() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture_with_limits(&server.uri(), 5, 1_000_000);

        let mut statuses = Vec::new();
        let mut retry_afters = Vec::new();
        for _ in 0..10 {
            let response = f
                .app
                .clone()
                .oneshot(completion_request(
                    json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
                ))
                .await
                .unwrap();
            statuses.push(response.status());
            retry_afters
                .push(response.headers().get("retry-after").map(|v| v.to_str().unwrap().to_string()));
        }

        assert!(statuses[..5].iter().all(|s| *s == StatusCode::OK));
        assert!(statuses[5..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
        for retry in &retry_afters[5..] {
            let seconds: u64 = retry.as_deref().expect("Retry-After present").parse().unwrap();
            assert!(seconds >= 1);
        }
    }

    #[tokio::test]
    async fn tpm_budget_exhaustion_rejects_before_forwarding() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture_with_limits(&server.uri(), 100, 1_000);
        f.gateway.limiter.record_tokens(KEY, 1_000);

        let response = f
            .app
            .oneshot(completion_request(
                json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["error"]["code"], "token_rate_limit_exceeded");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Sessions through the pipeline
    // -----------------------------------------------------------------------

    fn session_request(body: Value, session: &str) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .header("x-gonka-session-id", session)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn session_header_injects_stored_history_before_the_new_turn() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());

        f.gateway.sessions.get_or_create("s1", KEY);
        f.gateway.sessions.append(
            "s1",
            vec![
                ChatMessage::text(Role::User, "A"),
                ChatMessage::text(Role::Assistant, "B"),
            ],
        );

        let body = json!({"model": "m1", "messages": [
            {"role": "system", "content": "S"},
            {"role": "user", "content": "C"}
        ]});
        let response = f.app.oneshot(session_request(body, "s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sent: Value =
            serde_json::from_slice(&server.received_requests().await.unwrap()[0].body).unwrap();
        assert_eq!(
            sent["messages"],
            json!([
                {"role": "system", "content": "S"},
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "B"},
                {"role": "user", "content": "C"}
            ])
        );
    }

    #[tokio::test]
    async fn completed_call_appends_the_user_assistant_pair() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());

        let body = json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]});
        f.app.oneshot(session_request(body, "fresh")).await.unwrap();

        let session = f.gateway.sessions.get("fresh").unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "hi");
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].content, "ok");
    }

    #[tokio::test]
    async fn session_usage_is_attributed_in_the_ledger() {
        let server = mock_upstream(ok_upstream_body()).await;
        let f = fixture(&server.uri());

        let body = json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]});
        f.app.oneshot(session_request(body, "sess-42")).await.unwrap();

        let usage = f.gateway.ledger.by_session("sess-42").unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.total_tokens, 4);
        assert!(usage.first_request > 0.0);
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_relays_frames_and_meters_the_last_usage_total() {
        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"o\"}}]}\n\
                        data: {\"choices\":[{\"delta\":{\"content\":\"k\"}}],\"usage\":{\"total_tokens\":5}}\n\
                        data: {\"usage\":{\"total_tokens\":9}}\n\
                        data: [DONE]\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;
        let f = fixture(&server.uri());

        let body = json!({"model": "m1", "stream": true,
                          "messages": [{"role": "user", "content": "hi"}]});
        let response = f.app.oneshot(session_request(body, "stream-sess")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/event-stream");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
        assert_eq!(response.headers().get("connection").unwrap(), "keep-alive");
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], "data: [DONE]");
        assert!(frames.iter().take(3).all(|f| f.starts_with("data: ")));

        // Metering: output = last observed total, input unknown ⇒ 0.
        let usage = f.gateway.ledger.by_key(KEY, 0.0).unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.total_input, 0);
        assert_eq!(usage.total_output, 9);
        assert_eq!(usage.total_tokens, 9);

        // A streaming call does not add an assistant turn to the session.
        let session = f.gateway.sessions.get("stream-sess").unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn streaming_without_usage_chunks_meters_zero() {
        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\ndata: [DONE]\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;
        let f = fixture(&server.uri());

        let body = json!({"model": "m1", "stream": true,
                          "messages": [{"role": "user", "content": "hi"}]});
        let response = f.app.oneshot(completion_request(body)).await.unwrap();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert!(String::from_utf8(bytes.to_vec()).unwrap().ends_with("data: [DONE]\n\n"));

        let usage = f.gateway.ledger.by_key(KEY, 0.0).unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.total_tokens, 0);
    }
}
