//! Blob keys: the SHA-1 digest of raw attachment content.

use crate::error::{BlobError, BlobResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a blob key in bytes (SHA-1 digest size).
pub const KEY_LENGTH: usize = 20;

/// The identity of a blob: the SHA-1 of its raw content.
///
/// Same bytes produce the same key, which produces the same storage path;
/// deduplication falls out of the addressing scheme.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; KEY_LENGTH]);

impl BlobKey {
    /// Computes the key for the given content.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Wraps a raw 20-byte digest.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-character hex digest.
    pub fn from_hex(s: &str) -> BlobResult<Self> {
        let decoded = hex::decode(s).map_err(|_| BlobError::InvalidKey(s.to_string()))?;
        let bytes: [u8; KEY_LENGTH] = decoded
            .try_into()
            .map_err(|_| BlobError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Parses a `sha1-<base64>` digest string, the form used in attachment
    /// stubs on the wire.
    pub fn from_digest_string(s: &str) -> BlobResult<Self> {
        let encoded = s
            .strip_prefix("sha1-")
            .ok_or_else(|| BlobError::InvalidKey(s.to_string()))?;
        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| BlobError::InvalidKey(s.to_string()))?;
        let bytes: [u8; KEY_LENGTH] = decoded
            .try_into()
            .map_err(|_| BlobError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding; this is the file stem inside the store.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The `sha1-<base64>` digest string used in attachment stubs.
    #[must_use]
    pub fn digest_string(&self) -> String {
        format!("sha1-{}", BASE64.encode(self.0))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self.to_hex())
    }
}
