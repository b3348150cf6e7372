//! Error types for the replication engine.

use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network-level failure (connect, reset, timeout).
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether a retry can reasonably succeed.
        retryable: bool,
    },

    /// The remote answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request URL (credentials masked).
        url: String,
    },

    /// The remote sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested change feed mode is not implemented.
    #[error("change feed mode {0} is not supported")]
    UnsupportedFeedMode(&'static str),

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] loam_core::CoreError),

    /// Attachment store failure.
    #[error("attachment error: {0}")]
    Blob(#[from] loam_blob::BlobError),

    /// Response body was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled by `stop()` or `go_offline()`.
    /// Never recorded as a replication's `last_error`.
    #[error("request cancelled")]
    Cancelled,

    /// I/O failure while streaming a response body.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// A transport error worth retrying.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// A transport error retrying cannot fix.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// The HTTP status behind this error, if there is one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transient failures: timeouts, resets, 408, 429 and 5xx. These are
    /// retried after backoff rather than surfaced as fatal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Io(_) => true,
            Self::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Authentication and authorisation failures (401, 403).
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    /// Whether this is a 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether this is a 409 conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }
}
