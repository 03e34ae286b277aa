//! SQLite-backed [`DocumentStore`] implementation.
//!
//! Documents keep their normalized markdown as a BLOB; sections are flat
//! rows carrying `parent_id`, `branch` (a JSON array), byte offsets and a
//! `position` preserving the document's pre-order. Replacing a document is
//! a delete-then-insert inside one transaction, with section and membership
//! rows removed by `ON DELETE CASCADE`.
//!
//! Every statement, reads included, runs through
//! [`db::retry_busy`](crate::db::retry_busy), so a concurrent writer holding
//! the lock causes a short backoff instead of an error.
//!
//! The store also takes part in backups: its snapshot is one JSON object
//! per line ([`SnapshottedDocument`]), content base64-encoded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use quarry_core::error::Error;
use quarry_core::markdown::clean_section_text;
use quarry_core::models::{
    new_id, now, AuthToken, Collection, CollectionShare, Document, Section, ShareLevel, User,
};
use quarry_core::snapshot::{Restorable, Snapshotable};
use quarry_core::store::{DocumentQuery, DocumentStore, LoadedSection};

use crate::db::{self, retry_busy};
use crate::migrate;

/// Page size used when streaming documents into a snapshot.
const SNAPSHOT_PAGE: usize = 100;

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// 256 bits of hashed randomness, URL-safe.
fn generate_secret() -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn offset(value: i64, what: &str) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("negative {} offset {}", what, value))
}

fn section_from_row(row: &SqliteRow, document_id: &str) -> Result<Section> {
    let branch: String = row.try_get("branch")?;
    Ok(Section {
        id: row.try_get("id")?,
        document_id: document_id.to_string(),
        parent_id: row.try_get("parent_id")?,
        level: row.try_get::<i64, _>("level")? as u32,
        branch: serde_json::from_str(&branch).context("decoding section branch")?,
        start: offset(row.try_get("start_offset")?, "start")?,
        end: offset(row.try_get("end_offset")?, "end")?,
    })
}

fn collection_from_row(row: &SqliteRow) -> Result<Collection> {
    Ok(Collection {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        description: row.try_get("description")?,
        owner_id: row.try_get("owner_id")?,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let roles: String = row.try_get("roles")?;
    Ok(User {
        id: row.try_get("id")?,
        provider: row.try_get("provider")?,
        subject: row.try_get("subject")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        roles: serde_json::from_str(&roles).context("decoding user roles")?,
        active: row.try_get("active")?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

fn token_from_row(row: &SqliteRow) -> Result<AuthToken> {
    Ok(AuthToken {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        label: row.try_get("label")?,
        value: row.try_get("value")?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

/// Appends `(owner = user OR member of an accessible collection)` for the
/// document alias `d`.
fn push_document_access(qb: &mut QueryBuilder<'_, Sqlite>, user_id: &str, access: Access) {
    qb.push(" AND (d.owner_id = ");
    qb.push_bind(user_id.to_string());
    qb.push(" OR EXISTS (SELECT 1 FROM documents_collections dc WHERE dc.document_id = d.id AND dc.collection_id IN (");
    push_accessible_collections(qb, user_id, access);
    qb.push(")))");
}

/// Appends a sub-select of collection ids the user owns or is shared on.
fn push_accessible_collections(qb: &mut QueryBuilder<'_, Sqlite>, user_id: &str, access: Access) {
    qb.push("SELECT id FROM collections WHERE owner_id = ");
    qb.push_bind(user_id.to_string());
    qb.push(" UNION SELECT collection_id FROM collection_shares WHERE user_id = ");
    qb.push_bind(user_id.to_string());
    if access == Access::Write {
        qb.push(" AND level = 'write'");
    }
}

fn push_document_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &DocumentQuery) {
    if !query.ids.is_empty() {
        qb.push(" AND d.id IN (");
        let mut ids = qb.separated(", ");
        for id in &query.ids {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(")");
    }
    if let Some(owner) = &query.owner_id {
        qb.push(" AND d.owner_id = ");
        qb.push_bind(owner.clone());
    }
    if !query.collections.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM documents_collections f WHERE f.document_id = d.id AND f.collection_id IN (");
        let mut ids = qb.separated(", ");
        for id in &query.collections {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated("))");
    }
}

fn push_paging(qb: &mut QueryBuilder<'_, Sqlite>, query: &DocumentQuery) {
    qb.push(" ORDER BY d.source LIMIT ");
    qb.push_bind(query.limit.map(|l| l as i64).unwrap_or(-1));
    qb.push(" OFFSET ");
    qb.push_bind(query.offset as i64);
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects to the file at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_store(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_document(&self, row: SqliteRow) -> Result<Document> {
        let id: String = row.try_get("id")?;
        let sections = sqlx::query(
            "SELECT id, parent_id, level, branch, start_offset, end_offset \
             FROM sections WHERE document_id = ? ORDER BY position",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| section_from_row(r, &id))
        .collect::<Result<Vec<_>>>()?;

        let collections: Vec<String> = sqlx::query_scalar(
            "SELECT collection_id FROM documents_collections WHERE document_id = ? ORDER BY collection_id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Document {
            source: row.try_get("source")?,
            etag: row.try_get("etag")?,
            owner_id: row.try_get("owner_id")?,
            content: row.try_get("content")?,
            collections,
            sections,
            created_at: from_ms(row.try_get("created_at")?),
            updated_at: from_ms(row.try_get("updated_at")?),
            id,
        })
    }

    async fn load_documents(&self, rows: Vec<SqliteRow>) -> Result<Vec<Document>> {
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(self.load_document(row).await?);
        }
        Ok(docs)
    }

    async fn save_one(&self, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents WHERE source = ? OR id = ?")
            .bind(&doc.source)
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source, etag, owner_id, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source)
        .bind(&doc.etag)
        .bind(&doc.owner_id)
        .bind(&doc.content)
        .bind(to_ms(doc.created_at))
        .bind(to_ms(doc.updated_at))
        .execute(&mut *tx)
        .await?;

        for (position, section) in doc.sections.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO sections (id, document_id, parent_id, position, level, branch,
                                      start_offset, end_offset)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&section.id)
            .bind(&doc.id)
            .bind(&section.parent_id)
            .bind(position as i64)
            .bind(section.level as i64)
            .bind(serde_json::to_string(&section.branch)?)
            .bind(section.start as i64)
            .bind(section.end as i64)
            .execute(&mut *tx)
            .await?;
        }

        for collection_id in &doc.collections {
            sqlx::query(
                "INSERT OR IGNORE INTO documents_collections (document_id, collection_id) VALUES (?, ?)",
            )
            .bind(&doc.id)
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ensure_exists(&self, table: &str, id: &str) -> Result<()> {
        let sql = &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", table);
        let exists: bool = retry_busy(|| async move {
            Ok(sqlx::query_scalar(sql).bind(id).fetch_one(&self.pool).await?)
        })
        .await?;
        if !exists {
            return Err(Error::NotFound.into());
        }
        Ok(())
    }

    async fn document_access(&self, user_id: &str, document_id: &str, access: Access) -> Result<bool> {
        self.ensure_exists("documents", document_id).await?;
        retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT EXISTS(SELECT 1 FROM documents d WHERE d.id = ");
            qb.push_bind(document_id.to_string());
            push_document_access(&mut qb, user_id, access);
            qb.push(")");
            Ok(qb.build_query_scalar::<bool>().fetch_one(&self.pool).await?)
        })
        .await
    }

    async fn collection_access(&self, user_id: &str, collection_id: &str, access: Access) -> Result<bool> {
        self.ensure_exists("collections", collection_id).await?;
        retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
            qb.push_bind(collection_id.to_string());
            qb.push(" IN (");
            push_accessible_collections(&mut qb, user_id, access);
            qb.push(")");
            Ok(qb.build_query_scalar::<bool>().fetch_one(&self.pool).await?)
        })
        .await
    }

    async fn user_documents(&self, user_id: &str, query: &DocumentQuery, access: Access) -> Result<Vec<Document>> {
        retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT d.* FROM documents d WHERE 1 = 1");
            push_document_filters(&mut qb, query);
            push_document_access(&mut qb, user_id, access);
            push_paging(&mut qb, query);
            let rows = qb.build().fetch_all(&self.pool).await?;
            self.load_documents(rows).await
        })
        .await
    }

    async fn user_collections(&self, user_id: &str, access: Access) -> Result<Vec<Collection>> {
        retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM collections WHERE id IN (");
            push_accessible_collections(&mut qb, user_id, access);
            qb.push(") ORDER BY label, id");
            qb.build()
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(collection_from_row)
                .collect()
        })
        .await
    }

    async fn set_memberships(&self, collection_id: &str, document_ids: &[String], add: bool) -> Result<()> {
        self.ensure_exists("collections", collection_id).await?;
        retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            for document_id in document_ids {
                let sql = if add {
                    "INSERT OR IGNORE INTO documents_collections (document_id, collection_id) \
                     SELECT id, ? FROM documents WHERE id = ?"
                } else {
                    "DELETE FROM documents_collections WHERE collection_id = ? AND document_id = ?"
                };
                sqlx::query(sql)
                    .bind(collection_id)
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    // ============ Documents ============

    async fn save_documents(&self, docs: &[Document]) -> Result<()> {
        for doc in docs {
            if doc.source.trim().is_empty() {
                return Err(Error::MissingSource.into());
            }
            retry_busy(|| self.save_one(doc))
                .await
                .with_context(|| format!("saving document {}", doc.source))?;
            debug!(source = %doc.source, sections = doc.sections.len(), "document saved");
        }
        Ok(())
    }

    async fn get_document_by_id(&self, id: &str) -> Result<Document> {
        retry_busy(|| async move {
            let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::NotFound)?;
            self.load_document(row).await
        })
        .await
    }

    async fn get_document_by_source(&self, source: &str) -> Result<Document> {
        retry_busy(|| async move {
            let row = sqlx::query("SELECT * FROM documents WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::NotFound)?;
            self.load_document(row).await
        })
        .await
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let affected = retry_busy(|| async move {
            Ok(sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected())
        })
        .await?;
        if affected == 0 {
            return Err(Error::NotFound.into());
        }
        Ok(())
    }

    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT d.* FROM documents d WHERE 1 = 1");
            push_document_filters(&mut qb, query);
            push_paging(&mut qb, query);
            let rows = qb.build().fetch_all(&self.pool).await?;
            self.load_documents(rows).await
        })
        .await
    }

    async fn get_section_by_id(&self, id: &str) -> Result<LoadedSection> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query(
                r#"
                SELECT s.id, s.document_id, s.parent_id, s.level, s.branch, s.start_offset,
                       s.end_offset, d.source, d.content
                FROM sections s JOIN documents d ON d.id = s.document_id
                WHERE s.id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;

        let document_id: String = row.try_get("document_id")?;
        let section = section_from_row(&row, &document_id)?;
        let content: Vec<u8> = row.try_get("content")?;
        if section.start > section.end || section.end > content.len() {
            return Err(Error::OutOfRange {
                start: section.start,
                end: section.end,
                len: content.len(),
            }
            .into());
        }
        let text = clean_section_text(&String::from_utf8_lossy(&content[section.start..section.end]));
        Ok(LoadedSection {
            source: row.try_get("source")?,
            content: text,
            section,
        })
    }

    async fn section_exists(&self, id: &str) -> Result<bool> {
        retry_busy(|| async move {
            Ok(sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sections WHERE id = ?)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?)
        })
        .await
    }

    async fn query_user_readable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>> {
        self.user_documents(user_id, query, Access::Read).await
    }

    async fn query_user_writable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>> {
        self.user_documents(user_id, query, Access::Write).await
    }

    async fn count_readable_documents(&self, user_id: &str) -> Result<u64> {
        let count: i64 = retry_busy(|| async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM documents d WHERE 1 = 1");
            push_document_access(&mut qb, user_id, Access::Read);
            Ok(qb.build_query_scalar().fetch_one(&self.pool).await?)
        })
        .await?;
        Ok(count as u64)
    }

    async fn can_read_document(&self, user_id: &str, document_id: &str) -> Result<bool> {
        self.document_access(user_id, document_id, Access::Read).await
    }

    async fn can_write_document(&self, user_id: &str, document_id: &str) -> Result<bool> {
        self.document_access(user_id, document_id, Access::Write).await
    }

    // ============ Collections ============

    async fn create_collection(&self, collection: &Collection) -> Result<()> {
        retry_busy(|| async move {
            sqlx::query(
                r#"
                INSERT INTO collections (id, label, description, owner_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&collection.id)
            .bind(&collection.label)
            .bind(&collection.description)
            .bind(&collection.owner_id)
            .bind(to_ms(collection.created_at))
            .bind(to_ms(collection.updated_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_collection(&self, collection: &Collection) -> Result<()> {
        let affected = retry_busy(|| async move {
            Ok(sqlx::query(
                "UPDATE collections SET label = ?, description = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&collection.label)
            .bind(&collection.description)
            .bind(to_ms(now()))
            .bind(&collection.id)
            .execute(&self.pool)
            .await?
            .rows_affected())
        })
        .await?;
        if affected == 0 {
            return Err(Error::NotFound.into());
        }
        Ok(())
    }

    async fn get_collection_by_id(&self, id: &str) -> Result<Collection> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query("SELECT * FROM collections WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;
        collection_from_row(&row)
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let affected = retry_busy(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM documents_collections WHERE collection_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let affected = sqlx::query("DELETE FROM collections WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(affected)
        })
        .await?;
        if affected == 0 {
            return Err(Error::NotFound.into());
        }
        info!(collection = %id, "collection deleted");
        Ok(())
    }

    async fn query_user_readable_collections(&self, user_id: &str) -> Result<Vec<Collection>> {
        self.user_collections(user_id, Access::Read).await
    }

    async fn query_user_writable_collections(&self, user_id: &str) -> Result<Vec<Collection>> {
        self.user_collections(user_id, Access::Write).await
    }

    async fn can_read_collection(&self, user_id: &str, collection_id: &str) -> Result<bool> {
        self.collection_access(user_id, collection_id, Access::Read).await
    }

    async fn can_write_collection(&self, user_id: &str, collection_id: &str) -> Result<bool> {
        self.collection_access(user_id, collection_id, Access::Write).await
    }

    async fn add_documents_to_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()> {
        self.set_memberships(collection_id, document_ids, true).await
    }

    async fn remove_documents_from_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()> {
        self.set_memberships(collection_id, document_ids, false).await
    }

    async fn create_collection_share(
        &self,
        collection_id: &str,
        user_id: &str,
        level: ShareLevel,
    ) -> Result<()> {
        self.ensure_exists("collections", collection_id).await?;
        retry_busy(|| async move {
            sqlx::query(
                r#"
                INSERT INTO collection_shares (collection_id, user_id, level)
                VALUES (?, ?, ?)
                ON CONFLICT(collection_id, user_id) DO UPDATE SET level = excluded.level
                "#,
            )
            .bind(collection_id)
            .bind(user_id)
            .bind(level.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete_collection_share(&self, collection_id: &str, user_id: &str) -> Result<()> {
        retry_busy(|| async move {
            sqlx::query("DELETE FROM collection_shares WHERE collection_id = ? AND user_id = ?")
                .bind(collection_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_collection_shares(&self, collection_id: &str) -> Result<Vec<CollectionShare>> {
        let rows = retry_busy(|| async move {
            Ok(sqlx::query(
                "SELECT collection_id, user_id, level FROM collection_shares WHERE collection_id = ? ORDER BY user_id",
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;
        rows.iter()
            .map(|row| -> Result<CollectionShare> {
                let level: String = row.try_get("level")?;
                Ok(CollectionShare {
                    collection_id: row.try_get("collection_id")?,
                    user_id: row.try_get("user_id")?,
                    level: level.parse()?,
                })
            })
            .collect()
    }

    // ============ Users ============

    async fn create_user(&self, user: &User) -> Result<User> {
        let roles = &serde_json::to_string(&user.roles)?;
        retry_busy(|| async move {
            sqlx::query(
                r#"
                INSERT INTO users (id, provider, subject, email, display_name, roles, active, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider, subject) DO UPDATE SET
                    email = excluded.email,
                    display_name = excluded.display_name
                "#,
            )
            .bind(&user.id)
            .bind(&user.provider)
            .bind(&user.subject)
            .bind(&user.email)
            .bind(&user.display_name)
            .bind(roles)
            .bind(user.active)
            .bind(to_ms(user.created_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_user_by_provider_subject(&user.provider, &user.subject)
            .await
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query("SELECT * FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;
        user_from_row(&row)
    }

    async fn get_user_by_provider_subject(&self, provider: &str, subject: &str) -> Result<User> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query("SELECT * FROM users WHERE provider = ? AND subject = ?")
                .bind(provider)
                .bind(subject)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;
        user_from_row(&row)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let roles = &serde_json::to_string(&user.roles)?;
        let affected = retry_busy(|| async move {
            Ok(sqlx::query(
                "UPDATE users SET email = ?, display_name = ?, roles = ?, active = ? WHERE id = ?",
            )
            .bind(&user.email)
            .bind(&user.display_name)
            .bind(roles)
            .bind(user.active)
            .bind(&user.id)
            .execute(&self.pool)
            .await?
            .rows_affected())
        })
        .await?;
        if affected == 0 {
            return Err(Error::NotFound.into());
        }
        Ok(())
    }

    // ============ Auth tokens ============

    async fn create_auth_token(&self, owner_id: &str, label: &str) -> Result<AuthToken> {
        self.ensure_exists("users", owner_id).await?;
        let token = AuthToken {
            id: new_id(),
            owner_id: owner_id.to_string(),
            label: label.to_string(),
            value: generate_secret(),
            created_at: now(),
        };
        let stored = &token;
        retry_busy(|| async move {
            sqlx::query(
                "INSERT INTO auth_tokens (id, owner_id, label, value, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&stored.id)
            .bind(&stored.owner_id)
            .bind(&stored.label)
            .bind(&stored.value)
            .bind(to_ms(stored.created_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(token)
    }

    async fn get_auth_token_by_id(&self, id: &str) -> Result<AuthToken> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query("SELECT * FROM auth_tokens WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;
        token_from_row(&row)
    }

    async fn get_auth_token_by_value(&self, value: &str) -> Result<AuthToken> {
        let row = retry_busy(|| async move {
            Ok(sqlx::query("SELECT * FROM auth_tokens WHERE value = ?")
                .bind(value)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?
        .ok_or(Error::NotFound)?;
        token_from_row(&row)
    }

    async fn get_user_auth_tokens(&self, user_id: &str) -> Result<Vec<AuthToken>> {
        retry_busy(|| async move {
            sqlx::query("SELECT * FROM auth_tokens WHERE owner_id = ? ORDER BY created_at, id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(token_from_row)
                .collect()
        })
        .await
    }

    async fn delete_auth_token(&self, id: &str) -> Result<()> {
        retry_busy(|| async move {
            sqlx::query("DELETE FROM auth_tokens WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}

// ============ Snapshot ============

/// One document in a store snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshottedDocument {
    pub id: String,
    pub source: String,
    pub etag: String,
    pub owner_id: String,
    /// Base64 of the markdown bytes.
    pub content: String,
    pub collections: Vec<String>,
    pub sections: Vec<SnapshottedSection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshottedSection {
    pub id: String,
    pub parent_id: Option<String>,
    pub level: u32,
    pub branch: Vec<String>,
    pub start: usize,
    pub end: usize,
}

impl From<&Document> for SnapshottedDocument {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            source: doc.source.clone(),
            etag: doc.etag.clone(),
            owner_id: doc.owner_id.clone(),
            content: STANDARD.encode(&doc.content),
            collections: doc.collections.clone(),
            sections: doc
                .sections
                .iter()
                .map(|s| SnapshottedSection {
                    id: s.id.clone(),
                    parent_id: s.parent_id.clone(),
                    level: s.level,
                    branch: s.branch.clone(),
                    start: s.start,
                    end: s.end,
                })
                .collect(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

impl SnapshottedDocument {
    pub fn into_document(self) -> Result<Document> {
        let content = STANDARD
            .decode(&self.content)
            .with_context(|| format!("decoding content of {}", self.source))?;
        let id = self.id;
        Ok(Document {
            sections: self
                .sections
                .into_iter()
                .map(|s| Section {
                    id: s.id,
                    document_id: id.clone(),
                    parent_id: s.parent_id,
                    level: s.level,
                    branch: s.branch,
                    start: s.start,
                    end: s.end,
                })
                .collect(),
            id,
            source: self.source,
            etag: self.etag,
            owner_id: self.owner_id,
            content,
            collections: self.collections,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl Snapshotable for SqliteDocumentStore {
    async fn generate_snapshot(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        let mut page = DocumentQuery {
            limit: Some(SNAPSHOT_PAGE),
            ..Default::default()
        };
        let mut written = 0usize;
        loop {
            let docs = self.query_documents(&page).await?;
            for doc in &docs {
                let mut line = serde_json::to_vec(&SnapshottedDocument::from(doc))?;
                line.push(b'\n');
                w.write_all(&line).await?;
            }
            written += docs.len();
            if docs.len() < SNAPSHOT_PAGE {
                break;
            }
            page.offset += SNAPSHOT_PAGE;
        }
        info!(documents = written, "document store snapshot written");
        Ok(())
    }
}

#[async_trait]
impl Restorable for SqliteDocumentStore {
    async fn restore_snapshot(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut lines = BufReader::new(r).lines();
        let mut restored = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: SnapshottedDocument =
                serde_json::from_str(&line).context("decoding snapshotted document")?;
            let doc = record.into_document()?;
            self.save_documents(std::slice::from_ref(&doc)).await?;
            restored += 1;
        }
        info!(documents = restored, "document store restored");
        Ok(())
    }
}
