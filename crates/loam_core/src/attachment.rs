//! Attachment metadata.

use crate::error::{CoreError, CoreResult};
use loam_blob::BlobKey;
use serde_json::{Map, Value};

/// Transport encoding of an attachment body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentEncoding {
    /// Stored and transferred verbatim.
    #[default]
    None,
    /// Transferred gzip-compressed; `encoded_length` is the compressed size.
    Gzip,
}

/// Metadata for one named attachment of a revision.
///
/// The body itself lives in the blob store, addressed by `blob_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    /// Attachment name (the key in the `_attachments` object).
    pub name: String,
    /// MIME content type.
    pub content_type: Option<String>,
    /// Decoded (real) length in bytes.
    pub length: u64,
    /// Encoded length; 0 unless `encoding` is `Gzip`.
    pub encoded_length: u64,
    /// Transport encoding.
    pub encoding: AttachmentEncoding,
    /// Generation of the revision that introduced this attachment.
    pub revpos: u64,
    /// Content hash of the body, once known.
    pub blob_key: Option<BlobKey>,
}

impl AttachmentRef {
    /// Creates a reference with the given name and content type.
    #[must_use]
    pub fn new(name: impl Into<String>, content_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            content_type,
            length: 0,
            encoded_length: 0,
            encoding: AttachmentEncoding::None,
            revpos: 0,
            blob_key: None,
        }
    }

    /// Checks the metadata invariants: an unencoded attachment has no
    /// encoded length, an encoded non-empty one must have one, and `revpos`
    /// is always positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self.encoding {
            AttachmentEncoding::None => {
                if self.encoded_length > 0 {
                    return false;
                }
            }
            AttachmentEncoding::Gzip => {
                if self.encoded_length == 0 && self.length > 0 {
                    return false;
                }
            }
        }
        self.revpos > 0
    }

    /// Parses an attachment stub from the wire format.
    pub fn from_stub(name: &str, stub: &Map<String, Value>) -> CoreResult<Self> {
        let encoding = match stub.get("encoding").and_then(Value::as_str) {
            Some("gzip") => AttachmentEncoding::Gzip,
            Some(other) => {
                return Err(CoreError::InvalidQuery(format!(
                    "unknown attachment encoding: {other}"
                )))
            }
            None => AttachmentEncoding::None,
        };
        let blob_key = match stub.get("digest").and_then(Value::as_str) {
            Some(digest) => Some(BlobKey::from_digest_string(digest)?),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            content_type: stub
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            length: stub.get("length").and_then(Value::as_u64).unwrap_or(0),
            encoded_length: stub
                .get("encoded_length")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            encoding,
            revpos: stub.get("revpos").and_then(Value::as_u64).unwrap_or(0),
            blob_key,
        })
    }

    /// Serialises back to the wire stub format.
    #[must_use]
    pub fn to_stub(&self) -> Map<String, Value> {
        let mut stub = Map::new();
        if let Some(ct) = &self.content_type {
            stub.insert("content_type".into(), Value::from(ct.clone()));
        }
        if let Some(key) = &self.blob_key {
            stub.insert("digest".into(), Value::from(key.digest_string()));
        }
        stub.insert("length".into(), Value::from(self.length));
        if self.encoding == AttachmentEncoding::Gzip {
            stub.insert("encoding".into(), Value::from("gzip"));
            stub.insert("encoded_length".into(), Value::from(self.encoded_length));
        }
        stub.insert("revpos".into(), Value::from(self.revpos));
        stub
    }
}
