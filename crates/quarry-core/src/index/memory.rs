//! In-memory [`Index`] for tests and ephemeral setups.
//!
//! Entries live in a `Vec` behind a `tokio::sync::RwLock`. Search is a
//! case-insensitive phrase match over whitespace-normalized section text,
//! ranked by the number of occurrences.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

use super::{Index, IndexEntry};
use crate::models::{group_hits, Document, SearchOptions, SearchResult};
use crate::snapshot::{Restorable, SnapshotParticipant, Snapshotable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredSection {
    source: String,
    section_id: String,
    content: String,
    collections: Vec<String>,
}

/// Brute-force phrase index.
#[derive(Default)]
pub struct MemoryIndex {
    sections: RwLock<Vec<StoredSection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sections.read().await.is_empty()
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl Index for MemoryIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        let mut fresh = Vec::with_capacity(doc.sections.len());
        for section in &doc.sections {
            fresh.push(StoredSection {
                source: doc.source.clone(),
                section_id: section.id.clone(),
                content: normalize(&doc.section_content(section)?),
                collections: doc.collections.clone(),
            });
        }
        let mut sections = self.sections.write().await;
        sections.retain(|s| s.source != doc.source);
        sections.extend(fresh);
        Ok(())
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        self.sections.write().await.retain(|s| s.source != source);
        Ok(())
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let phrase = normalize(query);
        if phrase.is_empty() {
            return Ok(Vec::new());
        }
        let sections = self.sections.read().await;
        let mut hits: Vec<(usize, usize)> = sections
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                opts.collections.is_empty()
                    || s.collections.iter().any(|c| opts.collections.contains(c))
            })
            .map(|(i, s)| (i, s.content.matches(phrase.as_str()).count()))
            .filter(|(_, n)| *n > 0)
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        if opts.max_results > 0 {
            hits.truncate(opts.max_results);
        }
        Ok(group_hits(hits.into_iter().map(|(i, _)| {
            let s = &sections[i];
            (s.source.clone(), s.section_id.clone())
        })))
    }

    async fn entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(self
            .sections
            .read()
            .await
            .iter()
            .map(|s| IndexEntry {
                source: s.source.clone(),
                section_id: s.section_id.clone(),
            })
            .collect())
    }

    fn snapshotter(&self) -> Option<&dyn SnapshotParticipant> {
        Some(self)
    }
}

#[async_trait]
impl Snapshotable for MemoryIndex {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let sections = self.sections.read().await.clone();
        for s in &sections {
            let mut line = serde_json::to_vec(s)?;
            line.push(b'\n');
            w.write_all(&line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Restorable for MemoryIndex {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut restored = Vec::new();
        let mut lines = BufReader::new(r).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let s: StoredSection =
                serde_json::from_str(&line).context("decoding memory index snapshot record")?;
            restored.push(s);
        }
        *self.sections.write().await = restored;
        Ok(())
    }
}
