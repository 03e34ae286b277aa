//! Query and results transformers for the search pipeline.
//!
//! Query transformers rewrite the query before it fans out to the child
//! indexes; results transformers filter the fused results afterwards. Both
//! run serially in the order they were configured.

pub mod hyde;
pub mod judge;
pub mod prune;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{SearchOptions, SearchResult};

pub use hyde::HydeTransformer;
pub use judge::JudgeTransformer;
pub use prune::PruneTransformer;

#[async_trait]
pub trait QueryTransformer: Send + Sync {
    /// Returns the query to search with, possibly expanded.
    async fn transform_query(&self, query: &str, opts: &SearchOptions) -> Result<String>;
}

#[async_trait]
pub trait ResultsTransformer: Send + Sync {
    /// Filters or reorders `results` for the original user `query`.
    async fn transform_results(
        &self,
        query: &str,
        results: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>>;
}

/// Drops sources whose section list is empty.
pub(crate) fn drop_empty(results: Vec<SearchResult>) -> Vec<SearchResult> {
    results.into_iter().filter(|r| !r.sections.is_empty()).collect()
}
