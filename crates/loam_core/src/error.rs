//! Error types for the database core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the database core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A document, revision or view was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A database name violates the naming rules.
    #[error("invalid database name: {0}")]
    InvalidName(String),

    /// A revision id was not of the form `N-hash`.
    #[error("invalid revision id: {0}")]
    InvalidRevisionId(String),

    /// The store was used after being closed.
    #[error("database is closed")]
    StoreClosed,

    /// Another process holds the manager directory lock.
    #[error("database directory is locked by another process")]
    DirectoryLocked,

    /// A query asked for something the view cannot provide
    /// (e.g. `reduce` on a view with no reduce function).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Transaction misuse (e.g. `end_transaction` without `begin`).
    #[error("transaction error: {0}")]
    Transaction(&'static str),

    /// Attachment store failure.
    #[error(transparent)]
    Blob(#[from] loam_blob::BlobError),

    /// JSON (de)serialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
