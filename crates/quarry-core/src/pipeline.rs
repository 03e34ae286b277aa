//! Weighted fan-out over several child indexes.
//!
//! # Search Algorithm
//!
//! 1. Run the query through every [`QueryTransformer`], in order.
//! 2. Query every child in parallel with `max_results × 2`.
//! 3. Fuse: for each child result from a child of weight `w`, add `1.5 × w`
//!    to the source's score and `1.0 × w` to each listed section's score.
//! 4. Sort sources by source score plus the sum of their section scores
//!    (descending, URL ascending on ties) and sections by score (descending,
//!    id ascending on ties). Truncate to `max_results` when non-zero.
//! 5. Run the fused list through every [`ResultsTransformer`], stopping
//!    early once it is empty.
//!
//! `index` fails fast: the first child failure drops its siblings. `search`
//! and `delete_by_source` let every child finish and report all failures
//! together. A panicking child is reported as [`Error::Panic`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{panic_message, Error};
use crate::index::{Index, IndexEntry};
use crate::models::{Document, SearchOptions, SearchResult};
use crate::snapshot::{read_multipart, write_multipart, Restorable, SnapshotParticipant, Snapshotable};
use crate::transform::{QueryTransformer, ResultsTransformer};

/// Default multipart boundary for pipeline snapshots.
pub const DEFAULT_BOUNDARY: &str = "quarry-index";

const SOURCE_WEIGHT: f64 = 1.5;
const SECTION_WEIGHT: f64 = 1.0;

/// A child index with its fusion weight and snapshot id.
#[derive(Clone)]
pub struct WeightedIndex {
    pub id: String,
    pub weight: f64,
    pub index: Arc<dyn Index>,
}

pub struct PipelineIndex {
    children: Vec<WeightedIndex>,
    query_transformers: Vec<Arc<dyn QueryTransformer>>,
    results_transformers: Vec<Arc<dyn ResultsTransformer>>,
    boundary: String,
}

impl Default for PipelineIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineIndex {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            query_transformers: Vec::new(),
            results_transformers: Vec::new(),
            boundary: DEFAULT_BOUNDARY.to_string(),
        }
    }

    /// Adds a child. `weight` must be positive and finite; `id` must be
    /// unique within the pipeline.
    pub fn with_index(mut self, id: impl Into<String>, index: Arc<dyn Index>, weight: f64) -> Result<Self> {
        let id = id.into();
        if !(weight.is_finite() && weight > 0.0) {
            bail!("index '{}' has invalid weight {}", id, weight);
        }
        if self.children.iter().any(|c| c.id == id) {
            bail!("duplicate index id '{}'", id);
        }
        self.children.push(WeightedIndex { id, weight, index });
        Ok(self)
    }

    pub fn with_query_transformer(mut self, t: Arc<dyn QueryTransformer>) -> Self {
        self.query_transformers.push(t);
        self
    }

    pub fn with_results_transformer(mut self, t: Arc<dyn ResultsTransformer>) -> Self {
        self.results_transformers.push(t);
        self
    }

    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn children(&self) -> &[WeightedIndex] {
        &self.children
    }
}

/// Runs one child operation, turning a panic into [`Error::Panic`].
async fn guarded<T, F>(id: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res.with_context(|| format!("index '{}'", id)),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            warn!(index = %id, panic = %msg, "child index panicked");
            Err(anyhow::Error::from(Error::Panic(msg)).context(format!("index '{}'", id)))
        }
    }
}

/// Weighted score fusion over per-child results.
pub fn fuse(per_child: &[(f64, Vec<SearchResult>)], max_results: usize) -> Vec<SearchResult> {
    let mut order: Vec<String> = Vec::new();
    let mut scores: HashMap<String, (f64, HashMap<String, f64>)> = HashMap::new();

    for (weight, results) in per_child {
        for r in results {
            let entry = scores.entry(r.source.clone()).or_insert_with(|| {
                order.push(r.source.clone());
                (0.0, HashMap::new())
            });
            entry.0 += SOURCE_WEIGHT * weight;
            for s in &r.sections {
                *entry.1.entry(s.clone()).or_insert(0.0) += SECTION_WEIGHT * weight;
            }
        }
    }

    let mut ranked: Vec<(f64, SearchResult)> = order
        .into_iter()
        .filter_map(|source| {
            let (source_score, sections) = scores.remove(&source)?;
            let total = source_score + sections.values().sum::<f64>();
            let mut sections: Vec<(String, f64)> = sections.into_iter().collect();
            sections.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            Some((
                total,
                SearchResult {
                    source,
                    sections: sections.into_iter().map(|(id, _)| id).collect(),
                },
            ))
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.source.cmp(&b.1.source)));

    let mut fused: Vec<SearchResult> = ranked.into_iter().map(|(_, r)| r).collect();
    if max_results > 0 {
        fused.truncate(max_results);
    }
    fused
}

#[async_trait]
impl Index for PipelineIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        try_join_all(
            self.children
                .iter()
                .map(|c| guarded(&c.id, c.index.index(doc))),
        )
        .await?;
        debug!(source = %doc.source, children = self.children.len(), "indexed document");
        Ok(())
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        let outcomes = join_all(
            self.children
                .iter()
                .map(|c| guarded(&c.id, c.index.delete_by_source(source))),
        )
        .await;
        let errors: Vec<anyhow::Error> = outcomes.into_iter().filter_map(|r| r.err()).collect();
        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let mut expanded = query.to_string();
        for t in &self.query_transformers {
            expanded = t.transform_query(&expanded, opts).await?;
        }

        let child_opts = SearchOptions {
            max_results: opts.max_results.saturating_mul(2),
            collections: opts.collections.clone(),
        };
        let outcomes = join_all(
            self.children
                .iter()
                .map(|c| guarded(&c.id, c.index.search(&expanded, &child_opts))),
        )
        .await;

        let mut per_child = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for (child, outcome) in self.children.iter().zip(outcomes) {
            match outcome {
                Ok(results) => per_child.push((child.weight, results)),
                Err(e) => errors.push(e),
            }
        }
        if let Some(err) = Error::aggregate(errors) {
            return Err(err);
        }

        let mut results = fuse(&per_child, opts.max_results);
        for t in &self.results_transformers {
            if results.is_empty() {
                break;
            }
            results = t.transform_results(query, results).await?;
        }
        Ok(results)
    }

    async fn entries(&self) -> Result<Vec<IndexEntry>> {
        let per_child = try_join_all(self.children.iter().map(|c| c.index.entries())).await?;
        let unique: BTreeSet<IndexEntry> = per_child.into_iter().flatten().collect();
        Ok(unique.into_iter().collect())
    }

    fn snapshotter(&self) -> Option<&dyn SnapshotParticipant> {
        Some(self)
    }
}

#[async_trait]
impl Snapshotable for PipelineIndex {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let parts: Vec<(&str, &dyn SnapshotParticipant)> = self
            .children
            .iter()
            .filter_map(|c| c.index.snapshotter().map(|s| (c.id.as_str(), s)))
            .collect();
        write_multipart(w, &self.boundary, &parts).await
    }
}

#[async_trait]
impl Restorable for PipelineIndex {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        read_multipart(r, &self.boundary, |id| {
            self.children
                .iter()
                .find(|c| c.id == id)
                .and_then(|c| c.index.snapshotter())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::markdown::Chunker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn result(source: &str, sections: &[&str]) -> SearchResult {
        SearchResult {
            source: source.into(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
        }
    }

    enum Behavior {
        Results(Vec<SearchResult>),
        Fail,
        Panic,
        Hang,
    }

    /// Index double with scripted behavior for every operation.
    struct Scripted {
        behavior: Behavior,
        seen: Mutex<Vec<(String, usize)>>,
        deletes: AtomicUsize,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                seen: Mutex::new(Vec::new()),
                deletes: AtomicUsize::new(0),
            })
        }

        async fn act<T>(&self, ok: T) -> Result<T> {
            match &self.behavior {
                Behavior::Results(_) => Ok(ok),
                Behavior::Fail => bail!("scripted failure"),
                Behavior::Panic => panic!("scripted panic"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ok)
                }
            }
        }
    }

    #[async_trait]
    impl Index for Scripted {
        async fn index(&self, _doc: &Document) -> Result<()> {
            self.act(()).await
        }

        async fn delete_by_source(&self, _source: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.act(()).await
        }

        async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
            self.seen
                .lock()
                .unwrap()
                .push((query.to_string(), opts.max_results));
            let out = match &self.behavior {
                Behavior::Results(r) => r.clone(),
                _ => Vec::new(),
            };
            self.act(out).await
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl QueryTransformer for Suffix {
        async fn transform_query(&self, query: &str, _opts: &SearchOptions) -> Result<String> {
            Ok(format!("{}{}", query, self.0))
        }
    }

    struct Emptying(AtomicUsize);

    #[async_trait]
    impl ResultsTransformer for Emptying {
        async fn transform_results(
            &self,
            _query: &str,
            _results: Vec<SearchResult>,
        ) -> Result<Vec<SearchResult>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn fusion_is_deterministic() {
        let fused = fuse(
            &[
                (1.0, vec![result("src1", &["s1", "s2"])]),
                (1.0, vec![result("src1", &["s2", "s3"]), result("src2", &["s4"])]),
            ],
            0,
        );
        assert_eq!(
            fused,
            vec![result("src1", &["s2", "s1", "s3"]), result("src2", &["s4"])]
        );
    }

    #[test]
    fn fusion_respects_weights_and_ties() {
        let fused = fuse(
            &[
                (1.0, vec![result("b", &["x"])]),
                (3.0, vec![result("c", &["y"])]),
                (1.0, vec![result("a", &["z"])]),
            ],
            2,
        );
        assert_eq!(fused, vec![result("c", &["y"]), result("a", &["z"])]);
    }

    #[tokio::test]
    async fn search_fuses_children_and_doubles_limit() {
        let a = Scripted::new(Behavior::Results(vec![result("src1", &["s1", "s2"])]));
        let b = Scripted::new(Behavior::Results(vec![
            result("src1", &["s2", "s3"]),
            result("src2", &["s4"]),
        ]));
        let pipeline = PipelineIndex::new()
            .with_index("a", a.clone(), 1.0)
            .unwrap()
            .with_index("b", b.clone(), 1.0)
            .unwrap()
            .with_query_transformer(Arc::new(Suffix(" one")))
            .with_query_transformer(Arc::new(Suffix(" two")));

        let opts = SearchOptions {
            max_results: 5,
            ..Default::default()
        };
        let out = pipeline.search("q", &opts).await.unwrap();
        assert_eq!(out[0], result("src1", &["s2", "s1", "s3"]));
        assert_eq!(a.seen.lock().unwrap()[0], ("q one two".to_string(), 10));
    }

    #[tokio::test]
    async fn empty_results_short_circuit_transformers() {
        let first = Arc::new(Emptying(AtomicUsize::new(0)));
        let second = Arc::new(Emptying(AtomicUsize::new(0)));
        let pipeline = PipelineIndex::new()
            .with_index(
                "a",
                Scripted::new(Behavior::Results(vec![result("s", &["x"])])),
                1.0,
            )
            .unwrap()
            .with_results_transformer(first.clone())
            .with_results_transformer(second.clone());
        let out = pipeline.search("q", &SearchOptions::default()).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn child_panic_becomes_error() {
        let pipeline = PipelineIndex::new()
            .with_index("ok", Scripted::new(Behavior::Results(vec![])), 1.0)
            .unwrap()
            .with_index("boom", Scripted::new(Behavior::Panic), 1.0)
            .unwrap();
        let err = pipeline
            .search("q", &SearchOptions::default())
            .await
            .unwrap_err();
        match Error::kind_of(&err) {
            Some(Error::Panic(msg)) => assert!(msg.contains("scripted panic")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_runs_every_child_and_aggregates() {
        let a = Scripted::new(Behavior::Fail);
        let b = Scripted::new(Behavior::Fail);
        let c = Scripted::new(Behavior::Results(vec![]));
        let pipeline = PipelineIndex::new()
            .with_index("a", a.clone(), 1.0)
            .unwrap()
            .with_index("b", b.clone(), 1.0)
            .unwrap()
            .with_index("c", c.clone(), 1.0)
            .unwrap();
        let err = pipeline.delete_by_source("s").await.unwrap_err();
        assert!(matches!(Error::kind_of(&err), Some(Error::Aggregated(e)) if e.len() == 2));
        assert_eq!(c.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn index_failure_cancels_siblings() {
        let pipeline = PipelineIndex::new()
            .with_index("slow", Scripted::new(Behavior::Hang), 1.0)
            .unwrap()
            .with_index("bad", Scripted::new(Behavior::Fail), 1.0)
            .unwrap();
        let doc = Chunker::default().parse(b"# T\nbody\n").unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), pipeline.index(&doc)).await;
        assert!(res.expect("index should not wait for the hanging child").is_err());
    }

    #[test]
    fn rejects_bad_weights() {
        let idx: Arc<dyn Index> = Arc::new(MemoryIndex::new());
        assert!(PipelineIndex::new().with_index("a", idx.clone(), 0.0).is_err());
        assert!(PipelineIndex::new().with_index("a", idx.clone(), f64::NAN).is_err());
        assert!(PipelineIndex::new()
            .with_index("a", idx.clone(), 1.0)
            .unwrap()
            .with_index("a", idx, 1.0)
            .is_err());
    }

    #[tokio::test]
    async fn snapshot_covers_snapshotable_children() {
        let lexical = Arc::new(MemoryIndex::new());
        let other = Arc::new(MemoryIndex::new());
        let mut doc = Chunker::default()
            .parse(b"# Keys\nrotate keys\n## Schedule\nmonthly\n")
            .unwrap();
        doc.source = "https://a".into();

        let pipeline = PipelineIndex::new()
            .with_index("lexical", lexical.clone(), 1.0)
            .unwrap()
            .with_index("other", other.clone(), 0.5)
            .unwrap()
            .with_index("stateless", Scripted::new(Behavior::Results(vec![])), 1.0)
            .unwrap();
        pipeline.index(&doc).await.unwrap();

        let mut buf = Vec::new();
        pipeline.generate_snapshot(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("snapshot-id: lexical"));
        assert!(!text.contains("snapshot-id: stateless"));

        let fresh_lexical = Arc::new(MemoryIndex::new());
        let fresh_other = Arc::new(MemoryIndex::new());
        let restored = PipelineIndex::new()
            .with_index("lexical", fresh_lexical.clone(), 1.0)
            .unwrap()
            .with_index("other", fresh_other.clone(), 0.5)
            .unwrap();
        restored.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(restored.entries().await.unwrap(), pipeline.entries().await.unwrap());
        assert_eq!(fresh_lexical.len().await, 2);
    }
}
