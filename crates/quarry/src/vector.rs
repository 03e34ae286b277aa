//! Embedding-backed section index.
//!
//! One little-endian `f32` vector per section lives in the `embeddings`
//! table of the document-store database, linked to its collections through
//! `embeddings_collections`. Search embeds the (optionally HyDE-expanded)
//! query and ranks candidates by L2 distance computed in Rust.
//!
//! Vectors are only comparable within one embedding model, so the model
//! name is recorded in `embeddings_metadata` and leads every snapshot. A
//! restore into an instance configured with another model is refused
//! before anything is written, and so is indexing while vectors of another
//! model remain stored.
//!
//! A restore replaces the whole index, like the lexical one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use quarry_core::error::Error;
use quarry_core::index::{Index, IndexEntry};
use quarry_core::llm::{blob_to_vec, l2_distance, vec_to_blob, LlmClient};
use quarry_core::models::{group_hits, new_id, Document, SearchOptions, SearchResult};
use quarry_core::snapshot::{Restorable, SnapshotParticipant, Snapshotable};
use quarry_core::transform::QueryTransformer;

use crate::db::retry_busy;

const MODEL_KEY: &str = "model";

/// Leading line of a vector snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshottedMetadata {
    pub model: String,
}

/// One embedded section in a vector snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshottedRecord {
    pub source: String,
    pub section_id: String,
    /// Base64 of the little-endian `f32` blob.
    pub embeddings: String,
    pub collections: Vec<String>,
}

struct EmbeddedSection {
    section_id: String,
    blob: Vec<u8>,
    collections: Vec<String>,
}

/// Fails when vectors of a model other than `current` are stored for any
/// source besides `source`.
async fn check_model(conn: &mut SqliteConnection, source: &str, current: &str) -> Result<()> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT value FROM embeddings_metadata WHERE key = ?")
            .bind(MODEL_KEY)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(stored) = stored else {
        return Ok(());
    };
    if stored == current {
        return Ok(());
    }
    let others: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE source != ?")
        .bind(source)
        .fetch_one(&mut *conn)
        .await?;
    if others > 0 {
        return Err(Error::StoredModelMismatch {
            stored,
            current: current.to_string(),
        }
        .into());
    }
    Ok(())
}

async fn insert_sections(
    conn: &mut SqliteConnection,
    source: &str,
    sections: &[EmbeddedSection],
) -> Result<()> {
    for section in sections {
        let id = new_id();
        sqlx::query(
            "INSERT INTO embeddings (id, source, section_id, embeddings) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source)
        .bind(&section.section_id)
        .bind(&section.blob)
        .execute(&mut *conn)
        .await?;
        for collection in &section.collections {
            sqlx::query(
                "INSERT OR IGNORE INTO embeddings_collections (embeddings_id, collection_id) VALUES (?, ?)",
            )
            .bind(&id)
            .bind(collection)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn set_model(conn: &mut SqliteConnection, model: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO embeddings_metadata (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(MODEL_KEY)
    .bind(model)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub struct VectorIndex {
    pool: SqlitePool,
    llm: Arc<dyn LlmClient>,
    hyde: Option<Arc<dyn QueryTransformer>>,
}

impl VectorIndex {
    /// `pool` must already carry the store schema.
    pub fn new(pool: SqlitePool, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            pool,
            llm,
            hyde: None,
        }
    }

    /// Expands queries with `hyde` before embedding them.
    pub fn with_hyde(mut self, hyde: Arc<dyn QueryTransformer>) -> Self {
        self.hyde = Some(hyde);
        self
    }

    /// Model the stored vectors were computed with, if any were stored.
    pub async fn stored_model(&self) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM embeddings_metadata WHERE key = ?")
                .bind(MODEL_KEY)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn replace_source(&self, source: &str, sections: &[EmbeddedSection]) -> Result<()> {
        let model = self.llm.embeddings_model();
        retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM embeddings WHERE source = ?")
                .bind(source)
                .execute(&mut *tx)
                .await?;
            if !sections.is_empty() {
                check_model(&mut tx, source, model).await?;
                insert_sections(&mut tx, source, sections).await?;
                set_model(&mut tx, model).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Index for VectorIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        if !doc.sections.is_empty() {
            let mut conn = self.pool.acquire().await?;
            check_model(&mut conn, &doc.source, self.llm.embeddings_model()).await?;
        }
        // Embed everything first: one failing section leaves the stored
        // vectors of this source untouched.
        let mut embedded = Vec::with_capacity(doc.sections.len());
        for section in &doc.sections {
            let content = doc.section_content(section)?;
            let vector = self
                .llm
                .embeddings(&content)
                .await
                .with_context(|| format!("embedding section {}", doc.section_url(section)))?;
            embedded.push(EmbeddedSection {
                section_id: section.id.clone(),
                blob: vec_to_blob(&vector),
                collections: doc.collections.clone(),
            });
        }
        self.replace_source(&doc.source, &embedded).await?;
        debug!(source = %doc.source, sections = embedded.len(), "indexed section embeddings");
        Ok(())
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        self.replace_source(source, &[]).await
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let expanded = match &self.hyde {
            Some(hyde) => hyde.transform_query(query, opts).await?,
            None => query.to_string(),
        };
        let target = self.llm.embeddings(&expanded).await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT e.source, e.section_id, e.embeddings FROM embeddings e");
        if !opts.collections.is_empty() {
            qb.push(
                " WHERE EXISTS (SELECT 1 FROM embeddings_collections ec \
                 WHERE ec.embeddings_id = e.id AND ec.collection_id IN (",
            );
            let mut ids = qb.separated(", ");
            for collection in &opts.collections {
                ids.push_bind(collection);
            }
            qb.push("))");
        }
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut scored = rows
            .iter()
            .map(|row| -> Result<(f32, String, String)> {
                let blob: Vec<u8> = row.try_get("embeddings")?;
                Ok((
                    l2_distance(&target, &blob_to_vec(&blob)),
                    row.try_get("source")?,
                    row.try_get("section_id")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.2.cmp(&b.2)));
        if opts.max_results > 0 {
            scored.truncate(opts.max_results);
        }
        Ok(group_hits(
            scored.into_iter().map(|(_, source, section)| (source, section)),
        ))
    }

    async fn entries(&self) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT source, section_id FROM embeddings ORDER BY source, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<IndexEntry> {
                Ok(IndexEntry {
                    source: row.try_get("source")?,
                    section_id: row.try_get("section_id")?,
                })
            })
            .collect()
    }

    fn snapshotter(&self) -> Option<&dyn SnapshotParticipant> {
        Some(self)
    }
}

#[async_trait]
impl Snapshotable for VectorIndex {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let model = match self.stored_model().await? {
            Some(stored) => stored,
            None => self.llm.embeddings_model().to_string(),
        };
        let mut header = serde_json::to_vec(&SnapshottedMetadata { model })?;
        header.push(b'\n');
        w.write_all(&header).await?;

        let rows = sqlx::query(
            r#"
            SELECT e.source, e.section_id, e.embeddings,
                   (SELECT group_concat(ec.collection_id, ' ')
                    FROM embeddings_collections ec
                    WHERE ec.embeddings_id = e.id) AS collections
            FROM embeddings e
            ORDER BY e.source, e.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embeddings")?;
            let collections: Option<String> = row.try_get("collections")?;
            let record = SnapshottedRecord {
                source: row.try_get("source")?,
                section_id: row.try_get("section_id")?,
                embeddings: STANDARD.encode(blob),
                collections: collections
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            w.write_all(&line).await?;
        }
        debug!(rows = rows.len(), "wrote vector snapshot");
        Ok(())
    }
}

#[async_trait]
impl Restorable for VectorIndex {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut lines = BufReader::new(r).lines();
        let header = loop {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => {
                    warn!("empty vector snapshot, nothing to restore");
                    return Ok(());
                }
            }
        };
        let metadata: SnapshottedMetadata =
            serde_json::from_str(&header).context("invalid vector snapshot header")?;
        let current = self.llm.embeddings_model();
        if metadata.model != current {
            return Err(Error::ModelMismatch {
                snapshot: metadata.model,
                current: current.to_string(),
            }
            .into());
        }

        let mut records: Vec<(String, EmbeddedSection)> = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let n = records.len() + 1;
            let record: SnapshottedRecord = serde_json::from_str(&line)
                .with_context(|| format!("invalid vector snapshot record {}", n))?;
            let blob = STANDARD
                .decode(&record.embeddings)
                .with_context(|| format!("invalid embedding in record {}", n))?;
            records.push((
                record.source,
                EmbeddedSection {
                    section_id: record.section_id,
                    blob,
                    collections: record.collections,
                },
            ));
        }

        let records = &records;
        let model = metadata.model.as_str();
        retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM embeddings_metadata").execute(&mut *tx).await?;
            for (source, section) in records {
                insert_sections(&mut tx, source, std::slice::from_ref(section)).await?;
            }
            if !records.is_empty() {
                set_model(&mut tx, model).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;
        debug!(records = records.len(), "restored vector snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteDocumentStore;
    use quarry_core::llm::OfflineClient;
    use quarry_core::markdown::Chunker;

    async fn open(model: &str) -> (tempfile::TempDir, VectorIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::open(&dir.path().join("store.sqlite"))
            .await
            .unwrap();
        let index = VectorIndex::new(store.pool().clone(), Arc::new(OfflineClient::new(model)));
        (dir, index)
    }

    fn with_model(index: &VectorIndex, model: &str) -> VectorIndex {
        VectorIndex::new(index.pool.clone(), Arc::new(OfflineClient::new(model)))
    }

    fn doc(source: &str, body: &str, collections: &[&str]) -> Document {
        let mut doc = Chunker::new(50).parse(body.as_bytes()).unwrap();
        doc.source = source.to_string();
        doc.collections = collections.iter().map(|c| c.to_string()).collect();
        doc
    }

    #[tokio::test]
    async fn nearest_sections_come_first() {
        let (_dir, index) = open("offline-hash-256").await;
        index
            .index(&doc("https://keys", "# Keys\nRotate the signing keys every quarter.\n", &["sec"]))
            .await
            .unwrap();
        index
            .index(&doc("https://bread", "# Bread\nBanana bread needs ripe bananas.\n", &["food"]))
            .await
            .unwrap();

        let hits = index
            .search("rotate signing keys", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits[0].source, "https://keys");

        let food = index
            .search(
                "rotate signing keys",
                &SearchOptions {
                    max_results: 10,
                    collections: vec!["food".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(food.len(), 1);
        assert_eq!(food[0].source, "https://bread");
        assert_eq!(
            index.stored_model().await.unwrap().as_deref(),
            Some("offline-hash-256")
        );
    }

    #[tokio::test]
    async fn snapshot_round_trips_between_same_models() {
        let (_dir, index) = open("m1").await;
        index
            .index(&doc("https://a", "# A\nalpha beta\n## B\ngamma delta\n", &["c1", "c2"]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        index.generate_snapshot(&mut buf).await.unwrap();

        let (_dir2, other) = open("m1").await;
        other.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(other.entries().await.unwrap(), index.entries().await.unwrap());
        let hits = other
            .search(
                "gamma delta",
                &SearchOptions {
                    max_results: 1,
                    collections: vec!["c2".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn restore_rejects_other_models_without_writing() {
        let (_dir, index) = open("m1").await;
        index
            .index(&doc("https://a", "# A\nalpha\n", &[]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        index.generate_snapshot(&mut buf).await.unwrap();

        let (_dir2, other) = open("m2").await;
        let err = other
            .restore_snapshot(&mut buf.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(
            Error::kind_of(&err),
            Some(Error::ModelMismatch { .. })
        ));
        assert!(other.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn indexing_refuses_to_mix_models() {
        let (_dir, m1) = open("m1").await;
        m1.index(&doc("https://old", "# Old\nalpha\n", &[]))
            .await
            .unwrap();

        let m2 = with_model(&m1, "m2");
        let err = m2
            .index(&doc("https://new", "# New\nbeta\n", &[]))
            .await
            .unwrap_err();
        match Error::kind_of(&err) {
            Some(Error::StoredModelMismatch { stored, current }) => {
                assert_eq!(stored, "m1");
                assert_eq!(current, "m2");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(m2.stored_model().await.unwrap().as_deref(), Some("m1"));
        let entries = m2.entries().await.unwrap();
        assert!(entries.iter().all(|e| e.source == "https://old"));

        // Once the old vectors are gone the new model takes over.
        m2.delete_by_source("https://old").await.unwrap();
        m2.index(&doc("https://new", "# New\nbeta\n", &[]))
            .await
            .unwrap();
        assert_eq!(m2.stored_model().await.unwrap().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn reindexing_the_only_source_may_switch_models() {
        let (_dir, m1) = open("m1").await;
        m1.index(&doc("https://only", "# Only\nalpha\n", &[]))
            .await
            .unwrap();
        let m2 = with_model(&m1, "m2");
        m2.index(&doc("https://only", "# Only\nalpha\n", &[]))
            .await
            .unwrap();
        assert_eq!(m2.stored_model().await.unwrap().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn restore_replaces_the_whole_index() {
        let (_dir, index) = open("m1").await;
        index
            .index(&doc("https://a", "# A\nalpha\n", &[]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        index.generate_snapshot(&mut buf).await.unwrap();

        let (_dir2, other) = open("m1").await;
        other
            .index(&doc("https://stale", "# Stale\nomega\n", &[]))
            .await
            .unwrap();
        other.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(other.entries().await.unwrap(), index.entries().await.unwrap());
    }
}
