//! LLM relevance judge.
//!
//! Sends the question and every candidate section to the model, which
//! answers with the identifiers worth keeping. Unknown identifiers in the
//! reply are ignored; sources left without sections are dropped.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{drop_empty, ResultsTransformer};
use crate::error::is_not_found;
use crate::llm::{stable_seed, ChatMessage, ChatRequest, LlmClient, ResponseFormat};
use crate::models::SearchResult;
use crate::store::SectionLookup;

/// Per-candidate content cap, in characters.
const MAX_CANDIDATE_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You judge which documentation sections help answer a question. \
For each candidate consider topical alignment with the question, whether it directly answers \
the question, and whether it provides context needed to understand an answer. \
Reply with the identifiers of the relevant candidates only, as JSON: {\"identifiers\": [..]}. \
Reply with an empty list when none are relevant.";

#[derive(Debug, Deserialize)]
struct Verdict {
    identifiers: Vec<String>,
}

pub struct JudgeTransformer {
    llm: Arc<dyn LlmClient>,
    sections: Arc<dyn SectionLookup>,
}

impl JudgeTransformer {
    pub fn new(llm: Arc<dyn LlmClient>, sections: Arc<dyn SectionLookup>) -> Self {
        Self { llm, sections }
    }
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "identifiers": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["identifiers"],
        "additionalProperties": false
    })
}

/// Strips a surrounding markdown code fence, which some models add even
/// in JSON mode.
fn unfence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[async_trait]
impl ResultsTransformer for JudgeTransformer {
    async fn transform_results(
        &self,
        query: &str,
        results: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>> {
        let mut prompt = format!("Question: {}\n\nCandidates:\n", query.trim());
        let mut candidates = 0usize;
        for result in &results {
            for id in &result.sections {
                match self.sections.load_section(id).await {
                    Ok(loaded) => {
                        let content: String = loaded.content.chars().take(MAX_CANDIDATE_CHARS).collect();
                        prompt.push_str(&format!(
                            "<candidate id=\"{}\" source=\"{}\">\n{}\n</candidate>\n",
                            id, result.source, content
                        ));
                        candidates += 1;
                    }
                    Err(e) if is_not_found(&e) => {
                        debug!(section = %id, "judge skipping stale section");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if candidates == 0 {
            return Ok(Vec::new());
        }

        let request = ChatRequest {
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            temperature: Some(0.0),
            seed: Some(stable_seed(query)),
            response_format: ResponseFormat::JsonSchema {
                name: "relevant_sections".to_string(),
                schema: response_schema(),
            },
        };
        let reply = self.llm.chat_completion(&request).await?;
        let verdict: Verdict = serde_json::from_str(unfence(&reply))
            .with_context(|| format!("judge returned malformed reply: {}", reply.trim()))?;
        let keep: HashSet<String> = verdict.identifiers.into_iter().collect();
        debug!(candidates, kept = keep.len(), "judge verdict");

        let filtered = results
            .into_iter()
            .map(|r| SearchResult {
                sections: r.sections.into_iter().filter(|s| keep.contains(s)).collect(),
                source: r.source,
            })
            .collect();
        Ok(drop_empty(filtered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::OfflineClient;
    use crate::transform::prune::tests::FixedSections;

    fn result(source: &str, sections: &[&str]) -> SearchResult {
        SearchResult {
            source: source.into(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn keeps_selected_and_drops_empty_sources() {
        let llm = Arc::new(OfflineClient::default());
        llm.push_reply(r#"{"identifiers": ["a2", "zz"]}"#).await;
        let judge = JudgeTransformer::new(
            llm.clone(),
            Arc::new(FixedSections::tree(&[&["a1"], &["a2"], &["b1"]])),
        );
        let out = judge
            .transform_results(
                "what is a2",
                vec![result("https://a", &["a1", "a2"]), result("https://b", &["b1"])],
            )
            .await
            .unwrap();
        assert_eq!(out, vec![result("https://a", &["a2"])]);

        let requests = llm.requests().await;
        assert!(matches!(
            requests[0].response_format,
            ResponseFormat::JsonSchema { .. }
        ));
        assert!(requests[0].messages[1].content.contains("content of b1"));
    }

    #[tokio::test]
    async fn accepts_fenced_json() {
        let llm = Arc::new(OfflineClient::default());
        llm.push_reply("```json\n{\"identifiers\": [\"a1\"]}\n```").await;
        let judge = JudgeTransformer::new(llm, Arc::new(FixedSections::tree(&[&["a1"]])));
        let out = judge
            .transform_results("q", vec![result("https://a", &["a1"])])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_is_an_error() {
        let llm = Arc::new(OfflineClient::default().with_default_reply("sure, a1"));
        let judge = JudgeTransformer::new(llm, Arc::new(FixedSections::tree(&[&["a1"]])));
        assert!(judge
            .transform_results("q", vec![result("https://a", &["a1"])])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn no_candidates_skips_the_model() {
        let llm = Arc::new(OfflineClient::default());
        let judge = JudgeTransformer::new(llm.clone(), Arc::new(FixedSections::tree(&[])));
        let out = judge
            .transform_results("q", vec![result("https://a", &["gone"])])
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(llm.requests().await.is_empty());
    }
}
