//! Content-addressed attachment storage.
//!
//! Attachment bodies are stored in a flat directory of files named by the
//! hex SHA-1 of their content, with a sibling `tmp/` directory for in-flight
//! writes:
//!
//! ```text
//! <dir>/
//! ├─ 9a0364b9e99bb480dd25e1f0284c8555c0f0ce8d.blob
//! ├─ da39a3ee5e6b4b0d3255bfef95601890afd80709.blob
//! └─ tmp/
//!    └─ 8f4b2a6c.blobtmp      # in-flight download, renamed on install
//! ```
//!
//! Identical content hashes to the same key and therefore the same path, so
//! deduplication is automatic. Writes go through a temp file and an atomic
//! rename; a rename that loses the race to an identical blob discards the
//! temp and treats the existing file as canonical.

mod error;
mod key;
mod store;
mod writer;

pub use error::{BlobError, BlobResult};
pub use key::BlobKey;
pub use store::BlobStore;
pub use writer::BlobWriter;
