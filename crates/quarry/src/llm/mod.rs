//! LLM provider selection.
//!
//! | `llm.provider.name` | Client |
//! |---------------------|--------|
//! | `"openai"` | [`OpenAiClient`] (any OpenAI-compatible endpoint) |
//! | `"offline"` | [`OfflineClient`] (feature-hashing embeddings, no network) |
//!
//! When `llm.provider.rate_limit` is set the client is wrapped in a
//! [`RateLimitedClient`], so every completion and embedding call shares one
//! minimum-interval budget.

pub mod openai;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use quarry_core::llm::{ChatRequest, LlmClient, OfflineClient};

use crate::config::ProviderConfig;
use crate::ratelimit::RateLimiter;

pub use openai::OpenAiClient;

/// Throttles every call of the wrapped client.
pub struct RateLimitedClient {
    inner: Arc<dyn LlmClient>,
    limiter: RateLimiter,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn LlmClient>, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl LlmClient for RateLimitedClient {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<String> {
        self.limiter.wait().await;
        self.inner.chat_completion(request).await
    }

    async fn embeddings(&self, input: &str) -> Result<Vec<f32>> {
        self.limiter.wait().await;
        self.inner.embeddings(input).await
    }

    fn chat_model(&self) -> &str {
        self.inner.chat_model()
    }

    fn embeddings_model(&self) -> &str {
        self.inner.embeddings_model()
    }
}

/// Creates the configured client.
pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn LlmClient>> {
    let client: Arc<dyn LlmClient> = match config.name.as_str() {
        "offline" => Arc::new(OfflineClient::default()),
        "openai" => Arc::new(OpenAiClient::new(config)?),
        other => bail!("Unknown LLM provider: {}", other),
    };
    Ok(match config.rate_limit()? {
        Some(interval) => Arc::new(RateLimitedClient::new(client, RateLimiter::new(interval))),
        None => client,
    })
}
