//! Language-model capability and vector utilities.
//!
//! [`LlmClient`] is the fixed capability set every provider adapter
//! satisfies: chat completions (optionally constrained to a JSON schema)
//! and text embeddings. Network-backed adapters live in the `quarry` app
//! crate; [`OfflineClient`] here is deterministic and needs no network.

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Shape the completion must follow.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Structured output validated against a JSON schema.
    JsonSchema {
        name: String,
        schema: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    /// Provider-side sampling seed for reproducible output.
    pub seed: Option<u64>,
    pub response_format: ResponseFormat,
}

/// Chat completion and embedding capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the assistant message content.
    async fn chat_completion(&self, request: &ChatRequest) -> Result<String>;

    /// Embeds one text into a fixed-dimension vector.
    async fn embeddings(&self, input: &str) -> Result<Vec<f32>>;

    fn chat_model(&self) -> &str;

    /// Identifies the vector space; vectors from different models are not
    /// comparable.
    fn embeddings_model(&self) -> &str;
}

/// Stable 64-bit seed for `text`, the first eight bytes of its SHA-256.
pub fn stable_seed(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Keep it positive for providers that take a signed integer.
    u64::from_be_bytes(bytes) >> 1
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use quarry_core::llm::{blob_to_vec, vec_to_blob};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverses [`vec_to_blob`]; trailing bytes that do not form a full `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Euclidean distance. Vectors of different lengths are infinitely far
/// apart.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

// ============ Offline client ============

/// Dimensionality of [`OfflineClient`] embeddings.
pub const OFFLINE_DIMS: usize = 256;

/// Deterministic client for tests and air-gapped installs.
///
/// Embeddings are signed feature hashes of lowercase word tokens, then
/// L2-normalized, so texts sharing words land close together. Completions
/// come from a queue of scripted replies and fall back to a fixed reply.
pub struct OfflineClient {
    model: String,
    default_reply: String,
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl Default for OfflineClient {
    fn default() -> Self {
        Self::new("offline-hash-256")
    }
}

impl OfflineClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            default_reply: String::new(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Queues a reply for the next completion call.
    pub async fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().await.push_back(reply.into());
    }

    /// Completion requests received so far.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }
}

fn hash_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; OFFLINE_DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let bucket = (u16::from_le_bytes([digest[0], digest[1]]) as usize) % OFFLINE_DIMS;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl LlmClient for OfflineClient {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<String> {
        self.requests.lock().await.push(request.clone());
        let queued = self.replies.lock().await.pop_front();
        Ok(queued.unwrap_or_else(|| self.default_reply.clone()))
    }

    async fn embeddings(&self, input: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(input))
    }

    fn chat_model(&self) -> &str {
        "offline"
    }

    fn embeddings_model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn l2_basics() {
        assert_eq!(l2_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(l2_distance(&[1.0], &[1.0]), 0.0);
        assert!(l2_distance(&[1.0], &[1.0, 2.0]).is_infinite());
    }

    #[test]
    fn seed_is_stable() {
        assert_eq!(stable_seed("how do I rotate keys"), stable_seed("how do I rotate keys"));
        assert_ne!(stable_seed("a"), stable_seed("b"));
        assert!(stable_seed("anything") <= i64::MAX as u64);
    }

    #[tokio::test]
    async fn offline_embeddings_cluster_by_vocabulary() {
        let client = OfflineClient::default();
        let q = client.embeddings("rotate signing keys").await.unwrap();
        let near = client
            .embeddings("How to rotate the signing keys safely")
            .await
            .unwrap();
        let far = client.embeddings("banana bread recipe").await.unwrap();
        assert_eq!(q.len(), OFFLINE_DIMS);
        assert!(l2_distance(&q, &near) < l2_distance(&q, &far));
    }

    #[tokio::test]
    async fn offline_replies_are_queued() {
        let client = OfflineClient::default().with_default_reply("fallback");
        client.push_reply("first").await;
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        assert_eq!(client.chat_completion(&req).await.unwrap(), "first");
        assert_eq!(client.chat_completion(&req).await.unwrap(), "fallback");
        assert_eq!(client.requests().await.len(), 2);
    }
}
