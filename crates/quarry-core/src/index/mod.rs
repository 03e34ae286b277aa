//! Search index capability.
//!
//! An [`Index`] stores section-level entries keyed by the section URL
//! `source#section_id`, so every section of a document can be removed by
//! its source in one pass. Lexical and vector indexes live in the app
//! crate; [`PipelineIndex`](crate::pipeline::PipelineIndex) composes them.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Document, SearchOptions, SearchResult};
use crate::snapshot::SnapshotParticipant;

/// One indexed section.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub source: String,
    pub section_id: String,
}

#[async_trait]
pub trait Index: Send + Sync {
    /// Replaces every entry for `doc.source` with one per section.
    async fn index(&self, doc: &Document) -> Result<()>;

    /// Removes every entry for `source`. Deleting an unknown source is not
    /// an error.
    async fn delete_by_source(&self, source: &str) -> Result<()>;

    /// Ranked results grouped by source, best first.
    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>>;

    /// Every indexed `(source, section)` pair.
    async fn entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(Vec::new())
    }

    /// Snapshot support, for indexes that hold durable state.
    fn snapshotter(&self) -> Option<&dyn SnapshotParticipant> {
        None
    }
}
