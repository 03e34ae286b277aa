//! Database schema migrations.
//!
//! Every statement is idempotent (`IF NOT EXISTS`, plus an existence probe
//! for the FTS5 table, whose `CREATE` is not), so migrations run on every
//! open as well as from `quarry init`.
//!
//! # Document store
//!
//! ```text
//! documents ─┬─< sections          (cascade)
//!            ├─< documents_collections >─ collections ─< collection_shares >─ users
//!            └── owner_id ─────────────────────────────────────────────────── users
//!
//! documents_collections only cascades from documents: a restored backup
//! keeps memberships of collections that do not exist yet.
//! users ─< auth_tokens
//! embeddings ─< embeddings_collections
//! embeddings_metadata (model name of the stored vectors)
//! ```
//!
//! # Lexical index
//!
//! `lexical` is an FTS5 table keyed by the section URL, with the source,
//! section id and space-separated collection ids stored unindexed.

use anyhow::Result;
use sqlx::SqlitePool;

const STORE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        subject TEXT NOT NULL,
        email TEXT UNIQUE,
        display_name TEXT NOT NULL DEFAULT '',
        roles TEXT NOT NULL DEFAULT '[]',
        active INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        UNIQUE(provider, subject)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL UNIQUE,
        etag TEXT NOT NULL DEFAULT '',
        owner_id TEXT NOT NULL,
        content BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sections (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        parent_id TEXT,
        position INTEGER NOT NULL,
        level INTEGER NOT NULL,
        branch TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        owner_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents_collections (
        document_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        PRIMARY KEY (document_id, collection_id),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collection_shares (
        collection_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        level TEXT NOT NULL CHECK (level IN ('read', 'write')),
        PRIMARY KEY (collection_id, user_id),
        FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_tokens (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        label TEXT NOT NULL DEFAULT '',
        value TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        section_id TEXT NOT NULL,
        embeddings BLOB NOT NULL,
        UNIQUE(source, section_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings_collections (
        embeddings_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        PRIMARY KEY (embeddings_id, collection_id),
        FOREIGN KEY (embeddings_id) REFERENCES embeddings(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sections_document_id ON sections(document_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_documents_owner_id ON documents(owner_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_collections_collection ON documents_collections(collection_id)",
    "CREATE INDEX IF NOT EXISTS idx_collection_shares_user ON collection_shares(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_auth_tokens_owner ON auth_tokens(owner_id)",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_source ON embeddings(source)",
];

/// Creates the document-store and vector tables.
pub async fn migrate_store(pool: &SqlitePool) -> Result<()> {
    for statement in STORE_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Creates the FTS5 lexical table.
pub async fn migrate_lexical(pool: &SqlitePool) -> Result<()> {
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='lexical'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE lexical USING fts5(
                url UNINDEXED,
                source UNINDEXED,
                section_id UNINDEXED,
                collections UNINDEXED,
                content,
                tokenize = 'unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }
    Ok(())
}
