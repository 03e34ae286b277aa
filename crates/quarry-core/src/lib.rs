//! # Quarry Core
//!
//! Storage-agnostic logic for Quarry: the data model, the markdown section
//! chunker, the capability traits every backend implements, the weighted
//! pipeline index with its query/results transformers, the in-process task
//! runner, compensating workflows and multipart snapshot composition.
//!
//! Nothing in this crate touches a database, the network or the
//! filesystem. Concrete stores, indexes and LLM providers live in the
//! `quarry` application crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Typed error kinds carried inside `anyhow::Error` |
//! | [`models`] | `Document`, `Section`, `Collection`, `User`, `AuthToken`, search types |
//! | [`markdown`] | Markdown parsing into a word-budgeted section tree |
//! | [`store`] | `DocumentStore` capability and narrow lookup traits |
//! | [`index`] | `Index` capability and the in-memory phrase index |
//! | [`pipeline`] | Weighted fan-out over child indexes with score fusion |
//! | [`transform`] | HyDE expansion, duplicate pruning, LLM relevance judge |
//! | [`llm`] | `LlmClient` capability and the deterministic offline client |
//! | [`runner`] | Bounded-parallelism task runner |
//! | [`workflow`] | Ordered steps with reverse-order compensation |
//! | [`snapshot`] | Snapshot capabilities and multipart framing |

pub mod error;
pub mod index;
pub mod llm;
pub mod markdown;
pub mod models;
pub mod pipeline;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod transform;
pub mod workflow;
