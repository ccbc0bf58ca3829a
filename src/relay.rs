//! SSE relay for streaming completions.
//!
//! The relay owns both sides of a streamed call: it pumps upstream
//! `data: …` lines to the client verbatim (each followed by the blank line
//! the SSE framing requires) and runs a metering finalizer once the stream
//! ends. The finalizer runs on *every* exit path — `[DONE]`, upstream close,
//! or mid-stream failure — except client disconnect, which cancels the call
//! and skips metering entirely.
//!
//! `usage.total_tokens` is extracted opportunistically from each chunk; the
//! last observed value is what gets metered. Streamed assistant content is
//! never accumulated, so a streaming call does not add an assistant turn to
//! the stored session.

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
};

/// The SSE termination sentinel.
const DONE: &str = "[DONE]";

/// Build the client-facing SSE response for an upstream stream body and
/// spawn the pump task that drives it.
///
/// `on_complete` receives the last observed `usage.total_tokens` (0 when no
/// chunk carried usage).
pub fn sse_response(
    upstream: reqwest::Response,
    model: String,
    on_complete: impl FnOnce(i64) + Send + 'static,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
    tokio::spawn(pump(upstream, model, tx, on_complete));

    let headers = [
        ("content-type", "text/event-stream"),
        ("cache-control", "no-cache"),
        ("connection", "keep-alive"),
        ("x-accel-buffering", "no"),
    ];
    (headers, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

/// Read upstream lines, re-emit `data:` frames, finalize.
async fn pump(
    upstream: reqwest::Response,
    model: String,
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
    on_complete: impl FnOnce(i64) + Send,
) {
    let mut total_tokens: i64 = 0;

    let bytes = upstream.bytes_stream().map(|r| r.map_err(std::io::Error::other));
    let mut lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());

    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                let Some(data) = line.strip_prefix("data: ") else {
                    // Blank keep-alive lines and SSE comments are not relayed.
                    continue;
                };

                if data.trim() == DONE {
                    let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
                    break;
                }

                if let Ok(chunk) = serde_json::from_str::<Value>(data) {
                    if let Some(t) = chunk.pointer("/usage/total_tokens").and_then(Value::as_i64) {
                        total_tokens = t;
                    }
                }

                if tx.send(Ok(Bytes::from(format!("{line}\n\n")))).await.is_err() {
                    // Client went away: the call is cancelled, metering skipped.
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, %model, "upstream stream failed mid-flight");
                let envelope = json!({
                    "error": {
                        "message": format!(
                            "Model backend '{model}' is currently unavailable. Please retry."
                        ),
                        "type": "server_error",
                        "code": "backend_unavailable",
                    }
                });
                let _ = tx.send(Ok(Bytes::from(format!("data: {envelope}\n\n")))).await;
                break;
            }
            None => break, // upstream closed without a [DONE]
        }
    }

    on_complete(total_tokens);
}
