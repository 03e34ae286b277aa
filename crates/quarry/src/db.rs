//! SQLite connection management.
//!
//! Quarry keeps two database files: the document store (which also holds
//! the vector tables) and the lexical FTS5 index. Both are opened with WAL
//! journaling so searches can run while a single writer ingests, with
//! foreign keys enforced and a busy timeout so short write contention
//! waits instead of failing.
//!
//! # Write retry
//!
//! WAL still allows only one writer. When two transactions race, SQLite
//! answers `SQLITE_BUSY` or `SQLITE_LOCKED`; [`retry_busy`] reruns the
//! whole transaction with exponential backoff (at most 5 retries, 10ms up
//! to 500ms) and passes every other error straight through.

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_MAX_TIMES: usize = 5;
const RETRY_MIN_DELAY: Duration = Duration::from_millis(10);
const RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

/// Create a connection pool to the SQLite file at `path`.
///
/// Creates the file and its parent directories when missing.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Whether `err` is a transient lock conflict worth retrying.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        let Some(sqlx::Error::Database(db)) = e.downcast_ref::<sqlx::Error>() else {
            return false;
        };
        // Primary result codes 5 (BUSY) and 6 (LOCKED); extended codes keep
        // the primary code in the low byte.
        db.code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| matches!(c & 0xff, 5 | 6))
            .unwrap_or(false)
            || db.message().contains("database is locked")
    })
}

/// Runs `op` again while it fails with a lock conflict.
pub async fn retry_busy<T, F, Fut>(op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(RETRY_MIN_DELAY)
        .with_max_delay(RETRY_MAX_DELAY)
        .with_max_times(RETRY_MAX_TIMES);

    op.retry(backoff)
        .when(is_busy)
        .notify(|err, delay| debug!(error = %err, ?delay, "database busy, retrying"))
        .await
}
