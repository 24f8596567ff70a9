//! Completion transport.
//!
//! The step engine talks to an OpenAI-compatible `/chat/completions`
//! endpoint through the [`CompletionTransport`] trait so tests can script
//! replies. The HTTP implementation retries rate-limit responses with
//! exponential backoff and preserves error bodies for overflow
//! classification.

pub mod json_repair;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::LlmConfig;
use crate::error::LlmError;
use types::{ChatCompletionResponse, CompletionRequest};

/// Backoff parameters for rate-limit (HTTP 429) retries.
const BACKOFF_INITIAL_DELAY_SECS: f64 = 1.0;
const BACKOFF_EXPONENTIAL_BASE: f64 = 2.0;
const BACKOFF_MAX_RETRIES: u32 = 20;

#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn create(&self, request: &CompletionRequest)
        -> Result<ChatCompletionResponse, LlmError>;
}

/// Reqwest-backed transport for OpenAI-compatible endpoints.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.model_endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn send_once(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self.http.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Decode(e.to_string()))?;
        if parsed.choices.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl CompletionTransport for HttpCompletionClient {
    /// Send with exponential backoff on rate-limit responses only; all
    /// other failures propagate immediately.
    async fn create(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let mut num_retries = 0u32;
        let mut delay = BACKOFF_INITIAL_DELAY_SECS;

        loop {
            match self.send_once(request).await {
                Ok(resp) => return Ok(resp),
                Err(LlmError::Api { status: 429, body }) => {
                    num_retries += 1;
                    if num_retries > BACKOFF_MAX_RETRIES {
                        return Err(LlmError::RateLimitExhausted(BACKOFF_MAX_RETRIES));
                    }
                    let jitter: f64 = rand::thread_rng().gen();
                    delay *= BACKOFF_EXPONENTIAL_BASE * (1.0 + jitter);
                    tracing::warn!(
                        retry = num_retries,
                        delay_secs = delay as u64,
                        "rate limited by LLM backend ({body}), backing off"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
