//! Error types for the attachment store.

use thiserror::Error;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur in the attachment store.
#[derive(Error, Debug)]
pub enum BlobError {
    /// No blob with the given key exists in the store.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// A key string could not be parsed as a 20-byte hex digest.
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    /// The stored bytes no longer hash to the key they are filed under.
    #[error("blob {0} failed digest verification")]
    Corrupt(String),

    /// The writer was used out of order (e.g. `install` before `finish`).
    #[error("blob writer misuse: {0}")]
    WriterState(&'static str),

    /// Underlying filesystem error.
    #[error("attachment store I/O error: {0}")]
    Io(#[from] std::io::Error),
}
