//! # Quarry CLI (`quarry`)
//!
//! Local front end to a [`DocumentManager`]: ingestion, search, collection
//! management, backups.
//!
//! ## Usage
//!
//! ```bash
//! quarry --config ./config/quarry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `quarry init` | Create both databases and run migrations |
//! | `quarry index <file>` | Convert, chunk and index one file |
//! | `quarry search "<query>"` | Hybrid search over readable documents |
//! | `quarry reindex <collection>` | Re-index every document of a collection |
//! | `quarry cleanup` | Drop orphaned index entries and stale uploads |
//! | `quarry backup <out>` | Write a full backup |
//! | `quarry restore <in>` | Replace all state from a backup |
//! | `quarry collections create\|list` | Manage collections |
//!
//! Long-running commands run as tasks on an in-process runner; progress is
//! reported on stderr until the task finishes. Logs also go to stderr
//! (`RUST_LOG` overrides the default `info` filter), so stdout only carries
//! results.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quarry::config::{load_config, Config};
use quarry::{DocumentManager, IndexFileOptions};
use quarry_core::models::{new_id, now, Collection, SearchOptions, User, ROLE_USER};
use quarry_core::runner::TaskStatus;
use quarry_core::store::DocumentStore;

/// Quarry: document ingestion and hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, defaults plus `QUARRY_*` environment overrides apply.
#[derive(Parser)]
#[command(name = "quarry", version, about = "Document ingestion and hybrid retrieval")]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/quarry.toml`; ignored when that file is absent.
    #[arg(long, global = true, default_value = "./config/quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize both databases. Idempotent.
    Init,

    /// Convert, chunk and index one file.
    Index {
        file: PathBuf,

        /// Canonical URL of the document; overrides the front matter `source`.
        #[arg(long, default_value = "")]
        source: String,

        /// Opaque version tag stored with the document.
        #[arg(long, default_value = "")]
        etag: String,

        /// Collection id to add the document to. Repeatable.
        #[arg(long = "collection")]
        collections: Vec<String>,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// Restrict to a collection id. Repeatable.
        #[arg(long = "collection")]
        collections: Vec<String>,

        /// Maximum number of results; defaults to `llm.search.max_results`.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-index every document of a collection.
    Reindex { collection: String },

    /// Delete index entries whose section is gone, and stale uploads.
    Cleanup,

    /// Write a full backup to a file.
    Backup { out: PathBuf },

    /// Replace all state from a backup file.
    Restore { input: PathBuf },

    /// Manage collections.
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create a collection owned by the local user and print its id.
    Create {
        label: String,

        #[arg(long, default_value = "")]
        description: String,
    },
    /// List collections readable by the local user.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::from_env()?
    };

    let manager = DocumentManager::open(&cfg).await?;
    let user = local_user(&manager).await?;

    match cli.command {
        Commands::Init => {
            println!("Databases initialized successfully.");
        }
        Commands::Index {
            file,
            source,
            etag,
            collections,
        } => {
            let opts = IndexFileOptions {
                source,
                etag,
                collections,
            };
            let id = manager.index_file(&user.id, &file, opts).await?;
            run_task(&manager, &id).await?;
        }
        Commands::Search {
            query,
            collections,
            limit,
        } => {
            let opts = SearchOptions {
                max_results: limit.unwrap_or(cfg.llm.search.max_results),
                collections,
            };
            let results = manager.search(&user.id, &query, &opts).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                println!("{}. {}", i + 1, result.source);
                for section in &result.sections {
                    println!("    #{}", section);
                }
            }
        }
        Commands::Reindex { collection } => {
            let id = manager.reindex_collection(&user.id, &collection).await?;
            run_task(&manager, &id).await?;
        }
        Commands::Cleanup => {
            let id = manager.cleanup(&user.id).await?;
            run_task(&manager, &id).await?;
        }
        Commands::Backup { out } => {
            write_backup(&manager, &out).await?;
            println!("Backup written to {}", out.display());
        }
        Commands::Restore { input } => {
            let id = manager.restore_backup(&user.id, &input).await?;
            run_task(&manager, &id).await?;
        }
        Commands::Collections { action } => match action {
            CollectionAction::Create { label, description } => {
                let created = now();
                let collection = Collection {
                    id: new_id(),
                    label,
                    description,
                    owner_id: user.id.clone(),
                    created_at: created,
                    updated_at: created,
                };
                manager.store().create_collection(&collection).await?;
                println!("{}", collection.id);
            }
            CollectionAction::List => {
                let collections = manager
                    .store()
                    .query_user_readable_collections(&user.id)
                    .await?;
                for c in collections {
                    println!("{}\t{}\t{}", c.id, c.label, c.description);
                }
            }
        },
    }

    Ok(())
}

/// The operating-system user, registered under the `local` provider.
async fn local_user(manager: &DocumentManager) -> Result<User> {
    let subject = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string());
    manager
        .store()
        .create_user(&User {
            id: new_id(),
            provider: "local".to_string(),
            subject: subject.clone(),
            email: None,
            display_name: subject,
            roles: vec![ROLE_USER.to_string()],
            active: true,
            created_at: now(),
        })
        .await
}

/// Runs the runner until task `id` finishes, reporting progress on stderr.
async fn run_task(manager: &DocumentManager, id: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let runner = manager.runner().clone();
    let worker = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(cancel).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut last = (-1.0_f64, String::new());
    let state = loop {
        tokio::select! {
            state = manager.runner().wait(id) => break state?,
            _ = ticker.tick() => {
                let state = manager.runner().get(id).await?;
                if state.progress != last.0 || state.message != last.1 {
                    eprintln!("[{:>3.0}%] {}", state.progress * 100.0, state.message);
                    last = (state.progress, state.message);
                }
            }
        }
    };

    cancel.cancel();
    worker.await.context("task runner panicked")??;

    match state.status {
        TaskStatus::Succeeded => {
            eprintln!("[100%] done");
            Ok(())
        }
        _ => bail!(
            "task {} failed: {}",
            state.id,
            state.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn write_backup(manager: &DocumentManager, out: &Path) -> Result<()> {
    let file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);
    manager.backup(&mut writer).await?;
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;
    Ok(())
}
