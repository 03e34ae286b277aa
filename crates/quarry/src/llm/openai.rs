//! OpenAI-compatible HTTP client.
//!
//! Talks to `POST {base_url}/chat/completions` and `POST {base_url}/embeddings`,
//! which also covers Ollama, vLLM and other servers exposing the same API.
//!
//! Retry strategy:
//! - HTTP 429 or 5xx → retry with exponential backoff (base, 2×base, 4×base, ...)
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry
//!
//! When every attempt was answered with 429 the error carries
//! [`Error::RateLimited`](quarry_core::error::Error::RateLimited).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use quarry_core::error::Error;
use quarry_core::llm::{ChatRequest, LlmClient, ResponseFormat};

use crate::config::ProviderConfig;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
    chat_model: String,
    embeddings_model: String,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            chat_model: config.chat_completion_model.clone(),
            embeddings_model: config.embeddings_model.clone(),
            max_retries: config.max_retries,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Overrides the first retry delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;
        let mut rate_limited = false;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                debug!(attempt, ?delay, url = %url, "retrying provider request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.http.post(&url).json(body);
            if !self.key.is_empty() {
                request = request.bearer_auth(&self.key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .with_context(|| format!("decoding response from {}", url));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        rate_limited = status.as_u16() == 429;
                        warn!(%status, attempt, "provider request failed");
                        last_err = Some(anyhow!("provider error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("provider error {}: {}", status, body_text);
                }
                Err(e) => {
                    rate_limited = false;
                    warn!(error = %e, attempt, "provider request failed");
                    last_err = Some(e.into());
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("provider request failed after retries"));
        if rate_limited {
            return Err(anyhow::Error::new(Error::RateLimited).context(err.to_string()));
        }
        Err(err)
    }
}

/// Builds the `/chat/completions` body for `request`.
pub fn chat_body(model: &str, request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": request.messages,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(seed) = request.seed {
        body["seed"] = json!(seed);
    }
    if let ResponseFormat::JsonSchema { name, schema } = &request.response_format {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": name, "schema": schema, "strict": true },
        });
    }
    body
}

fn parse_chat_response(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(String::from)
        .ok_or_else(|| anyhow!("invalid chat response: missing choices[0].message.content"))
}

fn parse_embeddings_response(json: &Value) -> Result<Vec<f32>> {
    let embedding = json
        .pointer("/data/0/embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data[0].embedding"))?;
    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("invalid embeddings response: non-numeric component"))
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<String> {
        let json = self
            .post("/chat/completions", &chat_body(&self.chat_model, request))
            .await?;
        parse_chat_response(&json)
    }

    async fn embeddings(&self, input: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.embeddings_model, "input": input });
        let json = self.post("/embeddings", &body).await?;
        parse_embeddings_response(&json)
    }

    fn chat_model(&self) -> &str {
        &self.chat_model
    }

    fn embeddings_model(&self) -> &str {
        &self.embeddings_model
    }
}
