//! Task payloads and handlers.
//!
//! | Task type | Payload | Handler |
//! |-----------|---------|---------|
//! | `index_file` | [`IndexFilePayload`] | convert → parse → persist → index workflow |
//! | `cleanup` | [`CleanupPayload`] | drop index entries of vanished sections, stale uploads |
//! | `reindex_collection` | [`ReindexCollectionPayload`] | re-index every member document |
//! | `restore_backup` | [`RestoreBackupPayload`] | restore a composite backup file |
//!
//! Payloads are plain JSON so they read the same from any runner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use quarry_core::error::{is_not_found, Error};
use quarry_core::index::Index;
use quarry_core::markdown::{is_valid_source, Chunker};
use quarry_core::models::{now, Document};
use quarry_core::runner::{Task, TaskEvents, TaskHandler, TaskRunner};
use quarry_core::snapshot::{Restorable, SnapshotParticipant};
use quarry_core::store::{DocumentQuery, DocumentStore};
use quarry_core::workflow::{Step, Workflow};

use crate::cache::CachedDocumentStore;
use crate::converter::FileConverter;

pub const TASK_INDEX_FILE: &str = "index_file";
pub const TASK_CLEANUP: &str = "cleanup";
pub const TASK_REINDEX_COLLECTION: &str = "reindex_collection";
pub const TASK_RESTORE_BACKUP: &str = "restore_backup";

const REINDEX_PAGE: usize = 100;
const DEFAULT_UPLOAD_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFilePayload {
    /// Uploaded copy in the upload directory; removed once the task ends.
    pub path: PathBuf,
    pub original_name: String,
    pub etag: String,
    /// Overrides any `source` in the front matter when non-empty.
    pub source: String,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPayload {
    /// Uploads older than this are considered abandoned.
    #[serde(default = "default_upload_max_age")]
    pub upload_max_age_secs: u64,
}

fn default_upload_max_age() -> u64 {
    DEFAULT_UPLOAD_MAX_AGE_SECS
}

impl Default for CleanupPayload {
    fn default() -> Self {
        Self {
            upload_max_age_secs: DEFAULT_UPLOAD_MAX_AGE_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexCollectionPayload {
    #[serde(rename = "collectionID")]
    pub collection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreBackupPayload {
    pub path: PathBuf,
}

/// What the handlers work with.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn DocumentStore>,
    pub index: Arc<dyn Index>,
    pub converter: Arc<dyn FileConverter>,
    pub chunker: Chunker,
    pub upload_dir: PathBuf,
    /// Everything a backup covers.
    pub backup: Arc<dyn SnapshotParticipant>,
    /// Flushed after a restore.
    pub cache: Option<Arc<CachedDocumentStore>>,
}

/// Registers a handler for every task type.
pub async fn register_handlers(runner: &TaskRunner, services: &Services) {
    runner
        .register(
            TASK_INDEX_FILE,
            Arc::new(IndexFileHandler {
                services: services.clone(),
            }),
        )
        .await;
    runner
        .register(
            TASK_CLEANUP,
            Arc::new(CleanupHandler {
                services: services.clone(),
            }),
        )
        .await;
    runner
        .register(
            TASK_REINDEX_COLLECTION,
            Arc::new(ReindexCollectionHandler {
                services: services.clone(),
            }),
        )
        .await;
    runner
        .register(
            TASK_RESTORE_BACKUP,
            Arc::new(RestoreBackupHandler {
                services: services.clone(),
            }),
        )
        .await;
}

// ============ IndexFile ============

/// State threaded through the ingestion workflow.
pub struct Ingest {
    payload: IndexFilePayload,
    owner_id: String,
    events: TaskEvents,
    markdown: Vec<u8>,
    document: Option<Document>,
    /// The stored document this ingestion replaces, for rollback.
    replaced: Option<Document>,
}

struct ConvertStep {
    converter: Arc<dyn FileConverter>,
}

#[async_trait]
impl Step<Ingest> for ConvertStep {
    fn name(&self) -> &str {
        "convert"
    }

    async fn run(&self, state: &mut Ingest) -> Result<()> {
        state.markdown = self
            .converter
            .convert(&state.payload.path)
            .await
            .with_context(|| format!("converting {}", state.payload.original_name))?;
        state.events.progress(0.25).await;
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn undo(&self, state: &mut Ingest) -> Result<()> {
        remove_upload(&state.payload.path).await
    }
}

struct ParseStep {
    chunker: Chunker,
}

#[async_trait]
impl Step<Ingest> for ParseStep {
    fn name(&self) -> &str {
        "parse"
    }

    async fn run(&self, state: &mut Ingest) -> Result<()> {
        let mut doc = self.chunker.parse(&state.markdown)?;
        if !state.payload.source.is_empty() {
            doc.source = state.payload.source.clone();
        }
        if doc.source.is_empty() {
            return Err(Error::MissingSource.into());
        }
        if !is_valid_source(&doc.source) {
            return Err(Error::InvalidSource(doc.source).into());
        }
        doc.etag = state.payload.etag.clone();
        doc.owner_id = state.owner_id.clone();
        doc.collections = state.payload.collections.clone();
        state
            .events
            .message(format!("{} sections", doc.sections.len()))
            .await;
        state.events.progress(0.5).await;
        state.document = Some(doc);
        Ok(())
    }
}

struct PersistStep {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn Index>,
}

#[async_trait]
impl Step<Ingest> for PersistStep {
    fn name(&self) -> &str {
        "persist"
    }

    async fn run(&self, state: &mut Ingest) -> Result<()> {
        let doc = state
            .document
            .as_mut()
            .context("persist runs after parse")?;
        match self.store.get_document_by_source(&doc.source).await {
            Ok(existing) => {
                // Keep identity and creation time across re-uploads.
                doc.id = existing.id.clone();
                doc.created_at = existing.created_at;
                for section in doc.sections.iter_mut() {
                    section.document_id = existing.id.clone();
                }
                state.replaced = Some(existing);
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }
        doc.updated_at = now();
        self.store.save_documents(std::slice::from_ref(doc)).await?;
        state.events.progress(0.75).await;
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn undo(&self, state: &mut Ingest) -> Result<()> {
        let Some(doc) = &state.document else {
            return Ok(());
        };
        self.index.delete_by_source(&doc.source).await?;
        match &state.replaced {
            Some(previous) => {
                self.store
                    .save_documents(std::slice::from_ref(previous))
                    .await?;
                self.index.index(previous).await
            }
            None => match self.store.delete_document(&doc.id).await {
                Err(e) if is_not_found(&e) => Ok(()),
                other => other,
            },
        }
    }
}

struct IndexStep {
    index: Arc<dyn Index>,
}

#[async_trait]
impl Step<Ingest> for IndexStep {
    fn name(&self) -> &str {
        "index"
    }

    async fn run(&self, state: &mut Ingest) -> Result<()> {
        let doc = state.document.as_ref().context("index runs after parse")?;
        self.index.index(doc).await?;
        state.events.progress(1.0).await;
        Ok(())
    }
}

/// The ingestion workflow for one uploaded file.
pub fn ingest_workflow(services: &Services) -> Workflow<Ingest> {
    Workflow::new(TASK_INDEX_FILE)
        .step(ConvertStep {
            converter: services.converter.clone(),
        })
        .step(ParseStep {
            chunker: services.chunker.clone(),
        })
        .step(PersistStep {
            store: services.store.clone(),
            index: services.index.clone(),
        })
        .step(IndexStep {
            index: services.index.clone(),
        })
}

struct IndexFileHandler {
    services: Services,
}

#[async_trait]
impl TaskHandler for IndexFileHandler {
    async fn handle(&self, task: Task, events: TaskEvents) -> Result<()> {
        let payload: IndexFilePayload = task.payload()?;
        let path = payload.path.clone();
        let name = payload.original_name.clone();
        let state = Ingest {
            payload,
            owner_id: task.owner_id.clone(),
            events,
            markdown: Vec::new(),
            document: None,
            replaced: None,
        };
        let done = ingest_workflow(&self.services).execute(state).await?;
        if let Err(e) = remove_upload(&path).await {
            warn!(path = %path.display(), error = %e, "could not remove upload");
        }
        if let Some(doc) = &done.document {
            info!(file = %name, source = %doc.source, sections = doc.sections.len(), "indexed file");
        }
        Ok(())
    }
}

async fn remove_upload(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

// ============ Cleanup ============

struct CleanupHandler {
    services: Services,
}

#[async_trait]
impl TaskHandler for CleanupHandler {
    async fn handle(&self, task: Task, events: TaskEvents) -> Result<()> {
        let payload: CleanupPayload = task.payload()?;

        let entries = self.services.index.entries().await?;
        let mut stale: BTreeSet<String> = BTreeSet::new();
        for (i, entry) in entries.iter().enumerate() {
            if stale.contains(&entry.source) {
                continue;
            }
            if !self.services.store.section_exists(&entry.section_id).await? {
                stale.insert(entry.source.clone());
            }
            if i % 100 == 0 && !entries.is_empty() {
                events.progress(0.5 * i as f64 / entries.len() as f64).await;
            }
        }
        for source in &stale {
            debug!(source = %source, "removing stale index entries");
            self.services.index.delete_by_source(source).await?;
        }
        events.progress(0.5).await;

        let removed = remove_stale_uploads(
            &self.services.upload_dir,
            Duration::from_secs(payload.upload_max_age_secs),
        )
        .await?;
        events
            .message(format!(
                "removed {} stale sources and {} abandoned uploads",
                stale.len(),
                removed
            ))
            .await;
        info!(sources = stale.len(), uploads = removed, "cleanup finished");
        Ok(())
    }
}

/// Deletes regular files in `dir` last modified more than `max_age` ago.
pub async fn remove_stale_uploads(dir: &std::path::Path, max_age: Duration) -> Result<usize> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        if metadata.modified()? <= cutoff {
            remove_upload(&entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ============ ReindexCollection ============

struct ReindexCollectionHandler {
    services: Services,
}

#[async_trait]
impl TaskHandler for ReindexCollectionHandler {
    async fn handle(&self, task: Task, events: TaskEvents) -> Result<()> {
        let payload: ReindexCollectionPayload = task.payload()?;
        let collection = self
            .services
            .store
            .get_collection_by_id(&payload.collection_id)
            .await?;

        let mut offset = 0;
        let mut indexed = 0usize;
        loop {
            let page = self
                .services
                .store
                .query_documents(&DocumentQuery {
                    collections: vec![collection.id.clone()],
                    limit: Some(REINDEX_PAGE),
                    offset,
                    ..Default::default()
                })
                .await?;
            for doc in &page {
                self.services
                    .index
                    .index(doc)
                    .await
                    .with_context(|| format!("re-indexing {}", doc.source))?;
                indexed += 1;
            }
            events.message(format!("re-indexed {} documents", indexed)).await;
            if page.len() < REINDEX_PAGE {
                break;
            }
            offset += REINDEX_PAGE;
        }
        info!(collection = %collection.label, documents = indexed, "collection re-indexed");
        Ok(())
    }
}

// ============ RestoreBackup ============

struct RestoreBackupHandler {
    services: Services,
}

#[async_trait]
impl TaskHandler for RestoreBackupHandler {
    async fn handle(&self, task: Task, events: TaskEvents) -> Result<()> {
        let payload: RestoreBackupPayload = task.payload()?;
        let mut file = tokio::fs::File::open(&payload.path)
            .await
            .with_context(|| format!("opening backup {}", payload.path.display()))?;
        events.message("restoring").await;
        let restored = self.services.backup.restore_snapshot(&mut file).await;
        if let Some(cache) = &self.services.cache {
            cache.clear().await;
        }
        restored?;
        info!(path = %payload.path.display(), "backup restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_use_wire_names() {
        let payload = IndexFilePayload {
            path: "/tmp/u/1.md".into(),
            original_name: "notes.md".into(),
            etag: "e1".into(),
            source: String::new(),
            collections: vec!["c1".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["originalName"], "notes.md");

        let reindex: ReindexCollectionPayload =
            serde_json::from_value(serde_json::json!({"collectionID": "c9"})).unwrap();
        assert_eq!(reindex.collection_id, "c9");

        let cleanup: CleanupPayload = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cleanup, CleanupPayload::default());
    }

    #[tokio::test]
    async fn stale_uploads_are_removed_by_age() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(
            remove_stale_uploads(dir.path(), Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            remove_stale_uploads(dir.path(), Duration::ZERO).await.unwrap(),
            1
        );
        assert!(dir.path().join("nested").exists());
        assert_eq!(
            remove_stale_uploads(&dir.path().join("missing"), Duration::ZERO)
                .await
                .unwrap(),
            0
        );
    }
}
