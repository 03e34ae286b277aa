//! Full-text section index backed by SQLite FTS5.
//!
//! Every section of an indexed document becomes one row of the `lexical`
//! virtual table, keyed by its section URL `source#section_id`. Queries are
//! matched as a single phrase and ranked by FTS5's built-in BM25 `rank`.
//!
//! Collection ids are stored space-separated in an unindexed column; a
//! collection filter keeps rows whose list contains any requested id as a
//! whole token, matched literally.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use quarry_core::index::{Index, IndexEntry};
use quarry_core::models::{group_hits, Document, SearchOptions, SearchResult};
use quarry_core::snapshot::{Restorable, SnapshotParticipant, Snapshotable};

use crate::db::{self, retry_busy};
use crate::migrate::migrate_lexical;

/// One row of a lexical snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexicalRow {
    pub url: String,
    pub source: String,
    pub section_id: String,
    pub content: String,
    pub collections: Vec<String>,
}

pub struct LexicalIndex {
    pool: SqlitePool,
}

impl LexicalIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating when missing) the FTS5 database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate_lexical(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn replace_source(&self, source: &str, rows: &[LexicalRow]) -> Result<()> {
        retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM lexical WHERE source = ?")
                .bind(source)
                .execute(&mut *tx)
                .await?;
            for row in rows {
                insert_row(&mut tx, row).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

async fn insert_row(tx: &mut sqlx::Transaction<'_, Sqlite>, row: &LexicalRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO lexical (url, source, section_id, collections, content) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&row.url)
    .bind(&row.source)
    .bind(&row.section_id)
    .bind(row.collections.join(" "))
    .bind(&row.content)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Quotes `query` as one FTS5 phrase. Returns `None` when nothing is left
/// to match.
pub fn phrase_query(query: &str) -> Option<String> {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }
    Some(format!("\"{}\"", words.join(" ").replace('"', "\"\"")))
}

#[async_trait]
impl Index for LexicalIndex {
    async fn index(&self, doc: &Document) -> Result<()> {
        let mut rows = Vec::with_capacity(doc.sections.len());
        for section in &doc.sections {
            rows.push(LexicalRow {
                url: doc.section_url(section),
                source: doc.source.clone(),
                section_id: section.id.clone(),
                content: doc.section_content(section)?,
                collections: doc.collections.clone(),
            });
        }
        self.replace_source(&doc.source, &rows).await?;
        debug!(source = %doc.source, sections = rows.len(), "indexed lexical sections");
        Ok(())
    }

    async fn delete_by_source(&self, source: &str) -> Result<()> {
        self.replace_source(source, &[]).await
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let Some(phrase) = phrase_query(query) else {
            return Ok(Vec::new());
        };

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT source, section_id FROM lexical WHERE lexical MATCH ");
        qb.push_bind(phrase);
        if !opts.collections.is_empty() {
            qb.push(" AND (");
            for (i, collection) in opts.collections.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("instr(' ' || collections || ' ', ");
                qb.push_bind(format!(" {} ", collection));
                qb.push(") > 0");
            }
            qb.push(")");
        }
        qb.push(" ORDER BY rank LIMIT ");
        qb.push_bind(if opts.max_results > 0 {
            opts.max_results as i64
        } else {
            -1
        });

        let rows = qb.build().fetch_all(&self.pool).await?;
        let hits = rows
            .iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("source")?, row.try_get("section_id")?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(group_hits(hits))
    }

    async fn entries(&self) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT source, section_id FROM lexical ORDER BY source, rowid")
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
impl Snapshotable for LexicalIndex {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let rows = sqlx::query(
            "SELECT url, source, section_id, collections, content FROM lexical ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let collections: String = row.try_get("collections")?;
            let record = LexicalRow {
                url: row.try_get("url")?,
                source: row.try_get("source")?,
                section_id: row.try_get("section_id")?,
                content: row.try_get("content")?,
                collections: collections.split_whitespace().map(String::from).collect(),
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            w.write_all(&line).await?;
        }
        debug!(rows = rows.len(), "wrote lexical snapshot");
        Ok(())
    }
}

#[async_trait]
impl Restorable for LexicalIndex {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut records = Vec::new();
        let mut lines = BufReader::new(r).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: LexicalRow = serde_json::from_str(&line)
                .with_context(|| format!("invalid lexical snapshot row {}", records.len() + 1))?;
            records.push(record);
        }

        let records = &records;
        retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM lexical").execute(&mut *tx).await?;
            for record in records {
                insert_row(&mut tx, record).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;
        debug!(rows = records.len(), "restored lexical snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::markdown::Chunker;

    async fn open() -> (tempfile::TempDir, LexicalIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::open(&dir.path().join("lexical.sqlite"))
            .await
            .unwrap();
        (dir, index)
    }

    fn doc(source: &str, body: &str, collections: &[&str]) -> Document {
        let mut doc = Chunker::new(50).parse(body.as_bytes()).unwrap();
        doc.source = source.to_string();
        doc.collections = collections.iter().map(|c| c.to_string()).collect();
        doc
    }

    #[test]
    fn phrase_query_quotes_and_escapes() {
        assert_eq!(phrase_query("  hello   world "), Some("\"hello world\"".into()));
        assert_eq!(phrase_query("say \"hi\""), Some("\"say \"\"hi\"\"\"".into()));
        assert_eq!(phrase_query("   "), None);
    }

    #[tokio::test]
    async fn matches_phrases_and_filters_collections() {
        let (_dir, index) = open().await;
        index
            .index(&doc("https://a", "# Deploy\nRolling restart of the fleet.\n", &["ops"]))
            .await
            .unwrap();
        index
            .index(&doc("https://b", "# Notes\nA rolling restart is risky.\n", &["dev"]))
            .await
            .unwrap();

        let all = index
            .search("rolling restart", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let ops = index
            .search(
                "rolling restart",
                &SearchOptions {
                    max_results: 10,
                    collections: vec!["ops".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].source, "https://a");

        // Words present but not adjacent do not form the phrase.
        let none = index
            .search("restart rolling", &SearchOptions::default())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn collection_filter_is_literal() {
        let (_dir, index) = open().await;
        index
            .index(&doc("https://a", "# Deploy\nRolling restart of the fleet.\n", &["ops_x"]))
            .await
            .unwrap();

        for pattern in ["ops%", "ops_x%", "ops_", "%", "_ps_x", "ops"] {
            let hits = index
                .search(
                    "rolling restart",
                    &SearchOptions {
                        max_results: 10,
                        collections: vec![pattern.into()],
                    },
                )
                .await
                .unwrap();
            assert!(hits.is_empty(), "{} matched", pattern);
        }

        let exact = index
            .search(
                "rolling restart",
                &SearchOptions {
                    max_results: 10,
                    collections: vec!["ops_x".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[tokio::test]
    async fn restore_replaces_the_whole_index() {
        let (_dir, index) = open().await;
        index
            .index(&doc("https://a", "# A\nalpha text\n", &[]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        index.generate_snapshot(&mut buf).await.unwrap();

        let (_dir2, other) = open().await;
        other
            .index(&doc("https://stale", "# Stale\nomega text\n", &[]))
            .await
            .unwrap();
        other.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(other.entries().await.unwrap(), index.entries().await.unwrap());
    }

    #[tokio::test]
    async fn reindexing_replaces_previous_sections() {
        let (_dir, index) = open().await;
        index
            .index(&doc("https://a", "# One\nalpha text\n", &[]))
            .await
            .unwrap();
        index
            .index(&doc("https://a", "# Two\nbeta text\n", &[]))
            .await
            .unwrap();
        let alpha = index.search("alpha", &SearchOptions::default()).await.unwrap();
        assert!(alpha.is_empty());
        let entries = index.entries().await.unwrap();
        assert!(entries.iter().all(|e| e.source == "https://a"));

        index.delete_by_source("https://a").await.unwrap();
        assert!(index.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_restores_into_empty_index() {
        let (_dir, index) = open().await;
        index
            .index(&doc("https://a", "# Ops\nPager rotation schedule\n", &["ops"]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        index.generate_snapshot(&mut buf).await.unwrap();

        let (_dir2, other) = open().await;
        other.restore_snapshot(&mut buf.as_slice()).await.unwrap();
        assert_eq!(other.entries().await.unwrap(), index.entries().await.unwrap());
        let hits = other
            .search(
                "pager rotation",
                &SearchOptions {
                    max_results: 5,
                    collections: vec!["ops".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
