//! The streaming API client.
//!
//! One reqwest client serves both the agent runner (canonical event
//! streams) and the API proxy (raw body passthrough). Provider auth is
//! injected per the fixed table: Anthropic gets `x-api-key` +
//! `anthropic-version`, Gemini gets `x-goog-api-key`, everything else
//! gets `Authorization: Bearer`.
//!
//! Provider calls are retried only on transient network faults, at most
//! twice, with exponential backoff. Upstream non-2xx is never retried.

use std::time::Duration;

use serde_json::Value;

use hub_domain::error::{Error, Result};
use hub_domain::stream::{BoxStream, StreamEvent};

use crate::sse::sse_event_stream;
use crate::normalizer_for;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_RETRIES: u32 = 2;

/// Fixed upstream bases. Ollama (and unknown providers) have no public
/// endpoint and require a configured one.
pub fn upstream_base(provider: &str, configured: Option<&str>) -> Option<String> {
    match provider {
        "anthropic" => Some("https://api.anthropic.com".into()),
        "openai" => Some("https://api.openai.com".into()),
        "gemini" => Some("https://generativelanguage.googleapis.com".into()),
        _ => configured.map(|e| e.trim_end_matches('/').to_string()),
    }
}

/// Apply provider-specific auth headers to a request.
pub fn inject_auth(
    builder: reqwest::RequestBuilder,
    provider: &str,
    api_key: Option<&str>,
) -> reqwest::RequestBuilder {
    let Some(key) = api_key else {
        return builder;
    };
    match provider {
        "anthropic" => builder
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        "gemini" => builder.header("x-goog-api-key", key),
        _ => builder.header("Authorization", format!("Bearer {key}")),
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() && e.status().is_none()
}

pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Other(format!("building http client: {e}")))?;
        Ok(Self { client })
    }

    /// POST a request body, retrying transient connection faults.
    async fn post_with_retry(
        &self,
        provider: &str,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let builder = inject_auth(self.client.post(url), provider, api_key)
                .header("Content-Type", "application/json")
                .json(body);
            match builder.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if is_transient(&e) && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff = Duration::from_millis(250 * (1 << attempt));
                    tracing::warn!(
                        provider = %provider,
                        attempt,
                        error = %e,
                        "transient provider fault, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(Error::Proxy {
                        provider: provider.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// Send an LLM request and return the canonical event stream.
    pub async fn stream_events(
        &self,
        provider: &str,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        tracing::debug!(provider = %provider, url = %url, "llm stream request");
        let resp = self.post_with_retry(provider, url, api_key, body).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Proxy {
                provider: provider.to_string(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        Ok(sse_event_stream(resp, normalizer_for(provider)))
    }

    /// Forward a request upstream and hand back the raw response for
    /// chunk-by-chunk passthrough (the API proxy path).
    pub async fn forward_raw(
        &self,
        provider: &str,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<reqwest::Response> {
        self.post_with_retry(provider, url, api_key, body).await
    }
}
