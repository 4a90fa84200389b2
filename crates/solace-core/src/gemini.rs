//! Generation endpoint client.
//!
//! The endpoint is consumed as an opaque black box: POST
//! `{messages: [{role, parts:[{text}]}], stream: false}` and read `{text}`
//! back. Quota errors (HTTP 429) surface as a typed error carrying the
//! provider's retry-delay hint when one is present, so the breaker can honor
//! it instead of guessing.

use crate::conversation::WireMessage;
use crate::error::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Seam for the generative-text service. The dispatch engine and the crisis
/// classifier both speak through this trait so tests can substitute a mock.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, messages: &[WireMessage]) -> Result<String, DispatchError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    messages: &'a [WireMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: String,
}

/// HTTP client for the generation endpoint.
pub struct GeminiClient {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client,
        }
    }
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    async fn generate(&self, messages: &[WireMessage]) -> Result<String, DispatchError> {
        let body = GenerateRequest {
            messages,
            stream: false,
        };
        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;

        let status = res.status();
        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(res.headers());
            return Err(DispatchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(DispatchError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = res
            .json()
            .await
            .map_err(|e| DispatchError::Network(format!("response parse failed: {e}")))?;
        debug!(response_len = parsed.text.len(), "generation response received");
        Ok(parsed.text)
    }
}

/// `Retry-After: <seconds>` header, when the provider sends one.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    let secs: u64 = value.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}
