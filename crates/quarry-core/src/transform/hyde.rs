//! Hypothetical-document expansion.
//!
//! Short questions embed poorly. HyDE asks the model for a plausible answer
//! and searches with `query + "\n\n" + answer`, keeping the original words
//! so verbatim matches still land.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::QueryTransformer;
use crate::error::is_not_found;
use crate::llm::{stable_seed, ChatMessage, ChatRequest, LlmClient, ResponseFormat};
use crate::models::SearchOptions;
use crate::store::CollectionLookup;

const TEMPERATURE: f32 = 0.2;

const SYSTEM_PROMPT: &str = "You write short reference passages. Given a question, reply with a \
single factual paragraph that would answer it, written as if quoted from internal documentation. \
Do not mention that the passage is hypothetical and do not ask questions back.";

pub struct HydeTransformer {
    llm: Arc<dyn LlmClient>,
    collections: Arc<dyn CollectionLookup>,
}

impl HydeTransformer {
    pub fn new(llm: Arc<dyn LlmClient>, collections: Arc<dyn CollectionLookup>) -> Self {
        Self { llm, collections }
    }

    async fn prompt(&self, query: &str, opts: &SearchOptions) -> Result<String> {
        let mut prompt = format!("Question: {}\n", query.trim());
        let mut described = Vec::new();
        for id in &opts.collections {
            match self.collections.load_collection(id).await {
                Ok(c) if c.description.trim().is_empty() => described.push(format!("- {}", c.label)),
                Ok(c) => described.push(format!("- {}: {}", c.label, c.description.trim())),
                Err(e) if is_not_found(&e) => debug!(collection = %id, "unknown collection in HyDE prompt"),
                Err(e) => return Err(e),
            }
        }
        if !described.is_empty() {
            prompt.push_str("\nThe answer comes from documents in these collections:\n");
            prompt.push_str(&described.join("\n"));
            prompt.push('\n');
        }
        prompt.push_str("\nWrite the passage.");
        Ok(prompt)
    }
}

#[async_trait]
impl QueryTransformer for HydeTransformer {
    async fn transform_query(&self, query: &str, opts: &SearchOptions) -> Result<String> {
        if query.trim().is_empty() {
            return Ok(query.to_string());
        }
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(self.prompt(query, opts).await?),
            ],
            temperature: Some(TEMPERATURE),
            seed: Some(stable_seed(query)),
            response_format: ResponseFormat::Text,
        };
        let answer = self.llm.chat_completion(&request).await?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(query.to_string());
        }
        debug!(chars = answer.len(), "expanded query with hypothetical answer");
        Ok(format!("{}\n\n{}", query, answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::OfflineClient;
    use crate::models::{now, Collection};

    struct Collections(Vec<Collection>);

    #[async_trait]
    impl CollectionLookup for Collections {
        async fn load_collection(&self, id: &str) -> Result<Collection> {
            self.0
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| Error::NotFound.into())
        }
    }

    fn collection(id: &str, label: &str, description: &str) -> Collection {
        Collection {
            id: id.into(),
            label: label.into(),
            description: description.into(),
            owner_id: "u".into(),
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn expands_with_labels_and_stable_seed() {
        let llm = Arc::new(OfflineClient::default());
        llm.push_reply("  Keys rotate every 90 days.  ").await;
        llm.push_reply("Keys rotate every 90 days.").await;
        let hyde = HydeTransformer::new(
            llm.clone(),
            Arc::new(Collections(vec![collection("ops", "Operations", "Runbooks")])),
        );
        let opts = SearchOptions {
            collections: vec!["ops".into(), "missing".into()],
            ..Default::default()
        };

        let out = hyde.transform_query("how often do keys rotate", &opts).await.unwrap();
        assert_eq!(out, "how often do keys rotate\n\nKeys rotate every 90 days.");
        hyde.transform_query("how often do keys rotate", &opts).await.unwrap();

        let requests = llm.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].seed, requests[1].seed);
        assert_eq!(requests[0].temperature, Some(0.2));
        assert!(requests[0].messages[1].content.contains("- Operations: Runbooks"));
        assert!(!requests[0].messages[1].content.contains("missing"));
    }

    #[tokio::test]
    async fn empty_answer_keeps_query() {
        let hyde = HydeTransformer::new(
            Arc::new(OfflineClient::default()),
            Arc::new(Collections(vec![])),
        );
        let out = hyde
            .transform_query("plain", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "plain");
    }
}
