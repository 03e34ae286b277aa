//! Error kinds shared by every Quarry component.
//!
//! Fallible operations return [`anyhow::Result`]. When a caller needs to
//! tell one failure from another (missing entity, unsupported input,
//! cancellation, ...) the failure is raised as an [`Error`] value inside the
//! `anyhow::Error` and recovered with [`Error::kind_of`].
//!
//! ```rust
//! use quarry_core::error::{is_not_found, Error};
//!
//! let err: anyhow::Error = Error::NotFound.into();
//! assert!(is_not_found(&err));
//! assert_eq!(Error::http_status(&err), 404);
//! ```

use thiserror::Error as ThisError;

/// Typed failure kinds.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Entity absent.
    #[error("not found")]
    NotFound,

    /// The file converter cannot handle the extension.
    #[error("unsupported file extension '{extension}', accepted: {}", .supported.join(", "))]
    NotSupported {
        extension: String,
        supported: Vec<String>,
    },

    /// Document lacks a canonical source URL.
    #[error("document has no source")]
    MissingSource,

    /// The front-matter `source` is not a usable URL.
    #[error("invalid document source: {0}")]
    InvalidSource(String),

    /// Byte-range access outside the document buffer.
    #[error("range {start}..{end} out of bounds for content of length {len}")]
    OutOfRange { start: usize, end: usize, len: usize },

    /// The LLM provider refused the call and retries were exhausted.
    #[error("rate limited by LLM provider")]
    RateLimited,

    /// The operation was cancelled.
    #[error("operation canceled")]
    Canceled,

    /// Two or more sibling failures from a fan-out.
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregated(Vec<anyhow::Error>),

    /// A worker panicked; carries the stringified panic payload.
    #[error("panic: {0}")]
    Panic(String),

    /// A workflow step failed and one or more compensations failed too.
    #[error("{cause:#} (compensation failures: {})", join_errors(.failures))]
    Compensated {
        cause: anyhow::Error,
        failures: Vec<anyhow::Error>,
    },

    /// A vector snapshot was produced with a different embedding model.
    #[error("snapshot embedding model '{snapshot}' does not match configured model '{current}'")]
    ModelMismatch { snapshot: String, current: String },

    /// The vector index already holds embeddings from another model.
    #[error("stored embeddings use model '{stored}', refusing to add vectors from '{current}'")]
    StoredModelMismatch { stored: String, current: String },

    /// `TaskRunner::run` was called more than once.
    #[error("task runner is already running")]
    AlreadyRunning,
}

fn join_errors(errs: &[anyhow::Error]) -> String {
    errs.iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Returns the typed kind carried by `err`, if any.
    ///
    /// Looks through the whole context chain, so errors wrapped with
    /// `.context(..)` still resolve.
    pub fn kind_of(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|e| e.downcast_ref::<Error>())
    }

    /// Maps an error to the status code an HTTP collaborator should send.
    pub fn http_status(err: &anyhow::Error) -> u16 {
        match Error::kind_of(err) {
            Some(Error::NotFound) => 404,
            Some(Error::NotSupported { .. })
            | Some(Error::MissingSource)
            | Some(Error::InvalidSource(_)) => 400,
            Some(Error::Canceled) => 499,
            Some(Error::RateLimited) => 429,
            _ => 500,
        }
    }

    /// Collapses a list of sibling failures into one error.
    ///
    /// Returns `None` for an empty list, the error itself for a single
    /// failure, and [`Error::Aggregated`] otherwise.
    pub fn aggregate(mut errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(Error::Aggregated(errs).into()),
        }
    }
}

/// Shorthand for `Error::kind_of(err)` matching [`Error::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(Error::kind_of(err), Some(Error::NotFound))
}

/// Stringifies a panic payload recovered from a worker.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
