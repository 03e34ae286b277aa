//! Duplicate-content pruning.
//!
//! A parent section's bytes include its children's, so returning both wastes
//! context. Within each source:
//!
//! 1. drop every section that has a direct child in the list;
//! 2. of the rest, drop every section that still has an ancestor in the
//!    remaining set.
//!
//! Sections that no longer exist in the store are dropped as stale.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{drop_empty, ResultsTransformer};
use crate::error::is_not_found;
use crate::models::SearchResult;
use crate::store::SectionLookup;

pub struct PruneTransformer {
    sections: Arc<dyn SectionLookup>,
}

impl PruneTransformer {
    pub fn new(sections: Arc<dyn SectionLookup>) -> Self {
        Self { sections }
    }
}

/// Applies both pruning steps to `(id, branch)` pairs, keeping input order.
pub fn prune_branches(sections: &[(String, Vec<String>)]) -> Vec<String> {
    let parents: HashSet<&str> = sections
        .iter()
        .filter_map(|(_, branch)| branch.len().checked_sub(2).map(|i| branch[i].as_str()))
        .collect();

    let remaining: HashSet<&str> = sections
        .iter()
        .map(|(id, _)| id.as_str())
        .filter(|id| !parents.contains(id))
        .collect();

    sections
        .iter()
        .filter(|(id, branch)| {
            remaining.contains(id.as_str())
                && !branch
                    .iter()
                    .any(|ancestor| ancestor != id && remaining.contains(ancestor.as_str()))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

#[async_trait]
impl ResultsTransformer for PruneTransformer {
    async fn transform_results(
        &self,
        _query: &str,
        results: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>> {
        let mut out = Vec::with_capacity(results.len());
        for result in results {
            if result.sections.len() < 2 {
                out.push(result);
                continue;
            }
            let mut branches = Vec::with_capacity(result.sections.len());
            for id in &result.sections {
                match self.sections.load_section(id).await {
                    Ok(loaded) => branches.push((id.clone(), loaded.section.branch)),
                    Err(e) if is_not_found(&e) => {
                        debug!(section = %id, source = %result.source, "dropping stale section");
                    }
                    Err(e) => return Err(e),
                }
            }
            out.push(SearchResult {
                source: result.source,
                sections: prune_branches(&branches),
            });
        }
        Ok(drop_empty(out))
    }
}
