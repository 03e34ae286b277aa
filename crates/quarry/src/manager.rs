//! Entry point tying storage, indexes and tasks together.
//!
//! [`DocumentManager::open`] wires the configured components:
//!
//! ```text
//! SqliteDocumentStore ── CachedDocumentStore (optional)
//! PipelineIndex
//!   ├── "lexical"  LexicalIndex (FTS5)
//!   ├── "vector"   VectorIndex (+ HyDE when enabled)
//!   └── results:   PruneTransformer, JudgeTransformer (when enabled)
//! TaskRunner with the index_file / cleanup / reindex_collection /
//!   restore_backup handlers
//! ```
//!
//! Long-running work is scheduled on the runner and returns a task id;
//! the caller drives [`TaskRunner::run`](quarry_core::runner::TaskRunner::run).
//!
//! Backups are a composite with parts `documents` (the store) and `index`
//! (the pipeline, itself a composite of `lexical` and `vector`).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use quarry_core::error::is_not_found;
use quarry_core::index::Index;
use quarry_core::markdown::Chunker;
use quarry_core::models::{new_id, SearchOptions, SearchResult};
use quarry_core::pipeline::PipelineIndex;
use quarry_core::runner::{Task, TaskRunner};
use quarry_core::snapshot::SnapshotComposite;
use quarry_core::store::{CollectionLookup, DocumentStore, SectionLookup};
use quarry_core::transform::{HydeTransformer, JudgeTransformer, PruneTransformer};

use crate::cache::CachedDocumentStore;
use crate::config::Config;
use crate::converter::{build_converter, extension_of, FileConverter};
use crate::lexical::LexicalIndex;
use crate::llm::create_client;
use crate::sqlite_store::SqliteDocumentStore;
use crate::tasks::{
    register_handlers, CleanupPayload, IndexFilePayload, ReindexCollectionPayload,
    RestoreBackupPayload, Services, TASK_CLEANUP, TASK_INDEX_FILE, TASK_REINDEX_COLLECTION,
    TASK_RESTORE_BACKUP,
};
use crate::vector::VectorIndex;

/// Multipart boundary of whole-instance backups.
pub const BACKUP_BOUNDARY: &str = "quarry-backup";

/// Pipeline queries per search, each fetching twice as many results as the
/// last, while unreadable hits leave the page short.
const SEARCH_ROUNDS: usize = 3;

/// Options for [`DocumentManager::index_file`].
#[derive(Debug, Clone, Default)]
pub struct IndexFileOptions {
    /// Canonical URL; falls back to the front matter `source`.
    pub source: String,
    pub etag: String,
    pub collections: Vec<String>,
}

pub struct DocumentManager {
    services: Services,
    runner: TaskRunner,
    pipeline: Arc<PipelineIndex>,
}

impl DocumentManager {
    /// Opens every configured component and registers the task handlers.
    pub async fn open(config: &Config) -> Result<Self> {
        let sqlite = Arc::new(
            SqliteDocumentStore::open(&config.storage.database.dsn)
                .await
                .with_context(|| {
                    format!("opening {}", config.storage.database.dsn.display())
                })?,
        );

        let cache = if config.cache.enabled {
            Some(Arc::new(CachedDocumentStore::new(
                sqlite.clone(),
                config.cache.capacity,
                config.cache.ttl()?,
            )))
        } else {
            None
        };
        let (store, sections, collections): (
            Arc<dyn DocumentStore>,
            Arc<dyn SectionLookup>,
            Arc<dyn CollectionLookup>,
        ) = match &cache {
            Some(c) => (
                c.clone() as Arc<dyn DocumentStore>,
                c.clone() as Arc<dyn SectionLookup>,
                c.clone() as Arc<dyn CollectionLookup>,
            ),
            None => (
                sqlite.clone() as Arc<dyn DocumentStore>,
                sqlite.clone() as Arc<dyn SectionLookup>,
                sqlite.clone() as Arc<dyn CollectionLookup>,
            ),
        };

        let llm = create_client(&config.llm.provider)?;
        let search = &config.llm.search;

        let lexical = Arc::new(LexicalIndex::open(&config.storage.index.lexical_path()).await?);
        let mut vector = VectorIndex::new(sqlite.pool().clone(), llm.clone());
        if search.hyde {
            vector = vector.with_hyde(Arc::new(HydeTransformer::new(llm.clone(), collections)));
        }

        let mut pipeline = PipelineIndex::new()
            .with_index("lexical", lexical, search.lexical_weight)?
            .with_index("vector", Arc::new(vector), search.vector_weight)?
            .with_results_transformer(Arc::new(PruneTransformer::new(sections.clone())));
        if search.judge {
            pipeline =
                pipeline.with_results_transformer(Arc::new(JudgeTransformer::new(llm, sections)));
        }
        let pipeline = Arc::new(pipeline);

        let backup = SnapshotComposite::new(BACKUP_BOUNDARY)
            .with_part("documents", sqlite)
            .with_part("index", pipeline.clone());

        let services = Services {
            store,
            index: pipeline.clone(),
            converter: build_converter(&config.converter()?),
            chunker: Chunker::new(config.llm.index.max_words),
            upload_dir: config.upload_dir(),
            backup: Arc::new(backup),
            cache,
        };
        let runner = TaskRunner::new(config.runner()?);
        register_handlers(&runner, &services).await;

        info!(
            database = %config.storage.database.dsn.display(),
            provider = %config.llm.provider.name,
            hyde = search.hyde,
            judge = search.judge,
            "document manager ready"
        );
        Ok(Self {
            services,
            runner,
            pipeline,
        })
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.services.store
    }

    pub fn index(&self) -> &Arc<PipelineIndex> {
        &self.pipeline
    }

    async fn ensure_writable(&self, user_id: &str, collections: &[String]) -> Result<()> {
        for collection in collections {
            if !self
                .services
                .store
                .can_write_collection(user_id, collection)
                .await?
            {
                bail!("user {} may not write to collection {}", user_id, collection);
            }
        }
        Ok(())
    }

    /// Copies `file` into the upload directory and schedules its ingestion.
    ///
    /// Unsupported extensions fail here, before anything is copied.
    pub async fn index_file(&self, user_id: &str, file: &Path, opts: IndexFileOptions) -> Result<String> {
        let extension = extension_of(file);
        if !self.services.converter.supports(&extension) {
            return Err(quarry_core::error::Error::NotSupported {
                extension,
                supported: self.services.converter.supported_extensions(),
            }
            .into());
        }
        self.ensure_writable(user_id, &opts.collections).await?;

        tokio::fs::create_dir_all(&self.services.upload_dir)
            .await
            .with_context(|| format!("creating {}", self.services.upload_dir.display()))?;
        let upload: PathBuf = self
            .services
            .upload_dir
            .join(format!("{}{}", new_id(), extension));
        tokio::fs::copy(file, &upload)
            .await
            .with_context(|| format!("copying {} to {}", file.display(), upload.display()))?;

        let original_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let payload = IndexFilePayload {
            path: upload,
            original_name,
            etag: opts.etag,
            source: opts.source,
            collections: opts.collections,
        };
        self.runner
            .schedule(Task::new(TASK_INDEX_FILE, user_id, &payload)?)
            .await
    }

    pub async fn cleanup(&self, user_id: &str) -> Result<String> {
        self.runner
            .schedule(Task::new(TASK_CLEANUP, user_id, &CleanupPayload::default())?)
            .await
    }

    pub async fn reindex_collection(&self, user_id: &str, collection_id: &str) -> Result<String> {
        self.ensure_writable(user_id, &[collection_id.to_string()])
            .await?;
        let payload = ReindexCollectionPayload {
            collection_id: collection_id.to_string(),
        };
        self.runner
            .schedule(Task::new(TASK_REINDEX_COLLECTION, user_id, &payload)?)
            .await
    }

    pub async fn restore_backup(&self, user_id: &str, path: &Path) -> Result<String> {
        let payload = RestoreBackupPayload {
            path: path.to_path_buf(),
        };
        self.runner
            .schedule(Task::new(TASK_RESTORE_BACKUP, user_id, &payload)?)
            .await
    }

    /// Hybrid search, restricted to documents `user_id` may read.
    ///
    /// Hits the user may not read do not count against `max_results`: when
    /// filtering leaves fewer results than asked for, the pipeline is
    /// queried again with a larger limit.
    pub async fn search(&self, user_id: &str, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let wanted = opts.max_results;
        let mut fetch = opts.clone();
        for round in 1..=SEARCH_ROUNDS {
            let results = self.pipeline.search(query, &fetch).await?;
            let exhausted = fetch.max_results == 0 || results.len() < fetch.max_results;
            let mut readable = self.readable(user_id, results).await?;
            if wanted == 0 || readable.len() >= wanted || exhausted || round == SEARCH_ROUNDS {
                if wanted > 0 {
                    readable.truncate(wanted);
                }
                return Ok(readable);
            }
            debug!(round, found = readable.len(), wanted, "search page short after filtering");
            fetch.max_results = fetch.max_results.saturating_mul(2);
        }
        Ok(Vec::new())
    }

    async fn readable(&self, user_id: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        let mut readable = Vec::with_capacity(results.len());
        for result in results {
            let doc = match self.services.store.get_document_by_source(&result.source).await {
                Ok(doc) => doc,
                Err(e) if is_not_found(&e) => {
                    debug!(source = %result.source, "dropping result for a deleted document");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.services.store.can_read_document(user_id, &doc.id).await? {
                readable.push(result);
            }
        }
        Ok(readable)
    }

    /// Writes a full backup to `w`.
    pub async fn backup(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<()> {
        self.services.backup.generate_snapshot(w).await
    }
}
