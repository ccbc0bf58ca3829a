//! HTTP client for upstream chat-completion backends.
//!
//! All upstreams speak the OpenAI `/v1/chat/completions` protocol; the body
//! is forwarded as shaped by the pipeline, with no translation. Two clients
//! are held: one with the long completion deadline (applied to the whole
//! response, streaming included — an idle gap alone never cancels) and one
//! with a short deadline for liveness probes.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::Value;

/// Whole-response deadline for completion calls.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);
/// Deadline for health/registry probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UpstreamClient {
    client: Client,
    probe_client: Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .expect("failed to build upstream client");
        let probe_client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build probe client");
        Self { client, probe_client }
    }

    /// POST the shaped body to `{base_url}/v1/chat/completions`.
    ///
    /// Returns the raw response so callers can pass non-200s through
    /// verbatim or hand the body to the stream relay. Transport errors
    /// (connect, timeout) surface as `Err`.
    pub async fn chat_completions(
        &self,
        base_url: &str,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        self.client.post(&url).json(body).send().await
    }

    /// Probe a backend with `GET /v1/models` under the short deadline.
    pub async fn probe(&self, base_url: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
        let response = self
            .probe_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "backend probe returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}
