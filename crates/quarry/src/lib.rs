//! # Quarry
//!
//! **Document ingestion and hybrid retrieval backed by SQLite.**
//!
//! Quarry converts uploaded files to markdown, splits them into a tree of
//! word-budgeted sections, and keeps two indexes over those sections: an
//! FTS5 phrase index and an embedding index. Searches fan out to both,
//! fuse the weighted ranks, and pass the result through pruning and
//! (optionally) an LLM relevance judge.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │ Converters │──▶│ IndexFile    │──▶│ SqliteDocumentStore  │
//! │ md/pdf/... │   │ workflow     │   │ (+ CachedDocument-   │
//! └────────────┘   └──────┬───────┘   │    Store)            │
//!                         │           └──────────────────────┘
//!                         ▼
//!                  ┌──────────────┐
//!                  │ PipelineIndex│── lexical (FTS5)
//!                  │              │── vector  (embeddings)
//!                  └──────────────┘
//! ```
//!
//! Long-running operations run as tasks on the in-process
//! [`TaskRunner`](quarry_core::runner::TaskRunner); see [`tasks`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, `QUARRY_*` overrides, URI grammars |
//! | [`db`] | SQLite pool with WAL mode and BUSY retry |
//! | [`migrate`] | Idempotent schema for the store and the lexical index |
//! | [`sqlite_store`] | `DocumentStore` over SQLite, with snapshots |
//! | [`cache`] | LRU read-through cache over any `DocumentStore` |
//! | [`lexical`] | FTS5 phrase index |
//! | [`vector`] | Embedding index with L2 ranking |
//! | [`llm`] | OpenAI-compatible client and provider selection |
//! | [`ratelimit`] | Minimum-interval limiter shared by clients and converters |
//! | [`extract`] | Built-in PDF and OOXML text extraction |
//! | [`converter`] | File-to-markdown converters |
//! | [`tasks`] | Task payloads, handlers and the ingestion workflow |
//! | [`manager`] | `DocumentManager`, the wiring entry point |
//!
//! ## Configuration
//!
//! Quarry is configured via a TOML file (default: `config/quarry.toml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod cache;
pub mod config;
pub mod converter;
pub mod db;
pub mod extract;
pub mod lexical;
pub mod llm;
pub mod manager;
pub mod migrate;
pub mod ratelimit;
pub mod sqlite_store;
pub mod tasks;
pub mod vector;

pub use manager::{DocumentManager, IndexFileOptions};
pub use quarry_core::store;
