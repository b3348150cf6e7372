//! `multipart/related` document transfer.
//!
//! Pulled documents with attachments arrive as a multipart body: the first
//! part is the document JSON, and each later part carries the bytes of an
//! attachment whose stub says `follows: true`. The reader consumes the body
//! in arbitrary chunks, streams attachment parts straight into the blob
//! store, and amends the stubs with the resulting digest. The writer builds
//! the same shape for pushed uploads.

use crate::error::{ReplicationError, ReplicationResult};
use loam_blob::{BlobKey, BlobStore, BlobWriter};
use loam_core::Body;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, PartialEq)]
enum ReaderState {
    /// Before the first boundary.
    Preamble,
    /// Reading a part's header block.
    Headers,
    /// Streaming a part's content.
    Body,
    /// Just past a boundary, deciding between next part and close.
    AfterBoundary,
    /// Past the closing boundary.
    Epilogue,
}

/// Streaming parser for a `multipart/related` document response.
pub struct MultipartDocReader {
    boundary: Vec<u8>,
    buf: Vec<u8>,
    state: ReaderState,
    blobs: Arc<BlobStore>,
    document: Option<Body>,
    pending: VecDeque<String>,
    json_buf: Vec<u8>,
    writer: Option<(String, BlobWriter)>,
    part_index: usize,
}

impl MultipartDocReader {
    /// Creates a reader for a response with the given `Content-Type` header
    /// value. Attachment parts are written into `blobs`.
    pub fn new(content_type: &str, blobs: Arc<BlobStore>) -> ReplicationResult<Self> {
        let boundary = parse_boundary(content_type).ok_or_else(|| {
            ReplicationError::Protocol(format!("no multipart boundary in {content_type:?}"))
        })?;
        Ok(Self {
            boundary: boundary.into_bytes(),
            buf: Vec::new(),
            state: ReaderState::Preamble,
            blobs,
            document: None,
            pending: VecDeque::new(),
            json_buf: Vec::new(),
            writer: None,
            part_index: 0,
        })
    }

    /// Consumes the next chunk of the response body.
    pub fn append(&mut self, data: &[u8]) -> ReplicationResult<()> {
        self.buf.extend_from_slice(data);
        self.process()
    }

    /// Completes the parse and returns the document, with every
    /// `follows: true` stub replaced by `{digest, length}`.
    pub fn finish(mut self) -> ReplicationResult<Body> {
        if self.state != ReaderState::Epilogue {
            return Err(ReplicationError::Protocol(
                "multipart body ended before the closing boundary".into(),
            ));
        }
        if !self.pending.is_empty() {
            return Err(ReplicationError::Protocol(format!(
                "attachments never arrived: {:?}",
                self.pending
            )));
        }
        self.document
            .take()
            .ok_or_else(|| ReplicationError::Protocol("multipart body had no document part".into()))
    }

    fn process(&mut self) -> ReplicationResult<()> {
        loop {
            match self.state {
                ReaderState::Preamble => {
                    let delimiter = [b"--", self.boundary.as_slice()].concat();
                    match find(&self.buf, &delimiter) {
                        Some(idx) => {
                            self.buf.drain(..idx + delimiter.len());
                            self.state = ReaderState::Headers;
                        }
                        None => return Ok(()),
                    }
                }
                ReaderState::Headers => {
                    match find(&self.buf, b"\r\n\r\n") {
                        Some(idx) => {
                            // Part headers are informational; the document is
                            // recognised by position and attachments by stub
                            // order.
                            self.buf.drain(..idx + 4);
                            self.begin_part()?;
                            self.state = ReaderState::Body;
                        }
                        None => return Ok(()),
                    }
                }
                ReaderState::Body => {
                    let delimiter = [b"\r\n--", self.boundary.as_slice()].concat();
                    match find(&self.buf, &delimiter) {
                        Some(idx) => {
                            let content: Vec<u8> = self.buf.drain(..idx).collect();
                            self.buf.drain(..delimiter.len());
                            self.sink(&content)?;
                            self.end_part()?;
                            self.state = ReaderState::AfterBoundary;
                        }
                        None => {
                            // Flush all but a potential partial delimiter.
                            let keep = delimiter.len().saturating_sub(1).min(self.buf.len());
                            let flush_len = self.buf.len() - keep;
                            if flush_len > 0 {
                                let content: Vec<u8> = self.buf.drain(..flush_len).collect();
                                self.sink(&content)?;
                            }
                            return Ok(());
                        }
                    }
                }
                ReaderState::AfterBoundary => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if self.buf.starts_with(b"--") {
                        self.state = ReaderState::Epilogue;
                    } else {
                        self.state = ReaderState::Headers;
                    }
                }
                ReaderState::Epilogue => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    fn begin_part(&mut self) -> ReplicationResult<()> {
        if self.part_index == 0 {
            self.json_buf.clear();
        } else {
            let Some(name) = self.pending.front().cloned() else {
                return Err(ReplicationError::Protocol(
                    "more multipart parts than follows attachments".into(),
                ));
            };
            trace!(attachment = %name, "streaming attachment part");
            self.writer = Some((name, self.blobs.writer()?));
        }
        Ok(())
    }

    fn sink(&mut self, content: &[u8]) -> ReplicationResult<()> {
        if self.part_index == 0 {
            self.json_buf.extend_from_slice(content);
        } else if let Some((_, writer)) = self.writer.as_mut() {
            writer.append(content)?;
        }
        Ok(())
    }

    fn end_part(&mut self) -> ReplicationResult<()> {
        if self.part_index == 0 {
            let document: Body = serde_json::from_slice(&self.json_buf)?;
            self.pending = follows_attachments(&document).into();
            self.document = Some(document);
        } else if let Some((name, mut writer)) = self.writer.take() {
            let key = writer.finish()?;
            let length = writer.length();
            writer.install()?;
            self.pending.pop_front();
            self.amend_stub(&name, key, length)?;
        }
        self.part_index += 1;
        Ok(())
    }

    /// Replaces the attachment stub's transfer hints with the stored result.
    fn amend_stub(&mut self, name: &str, key: BlobKey, length: u64) -> ReplicationResult<()> {
        let stub = self
            .document
            .as_mut()
            .and_then(|doc| doc.get_mut("_attachments"))
            .and_then(Value::as_object_mut)
            .and_then(|atts| atts.get_mut(name))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                ReplicationError::Protocol(format!("part for unknown attachment {name:?}"))
            })?;

        if let Some(expected) = stub.get("digest").and_then(Value::as_str) {
            if let Ok(expected) = BlobKey::from_digest_string(expected) {
                if expected != key {
                    return Err(ReplicationError::Protocol(format!(
                        "attachment {name:?} digest mismatch"
                    )));
                }
            }
        }
        stub.remove("follows");
        stub.insert("digest".into(), Value::from(key.digest_string()));
        stub.insert("length".into(), Value::from(length));
        Ok(())
    }
}

/// Names of `follows: true` attachments in stub order.
fn follows_attachments(document: &Body) -> Vec<String> {
    document
        .get("_attachments")
        .and_then(Value::as_object)
        .map(|atts| {
            atts.iter()
                .filter(|(_, stub)| {
                    stub.get("follows").and_then(Value::as_bool).unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_boundary(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Finds `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Builds a `multipart/related` body: document JSON first, attachment
/// bodies after, in stub order.
pub struct MultipartWriter {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartWriter {
    /// A writer with a fresh random boundary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            boundary: uuid::Uuid::new_v4().simple().to_string(),
            body: Vec::new(),
        }
    }

    /// The `Content-Type` header value for the assembled body.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    /// Appends the document part.
    pub fn add_document(&mut self, document: &Body) -> ReplicationResult<()> {
        let json = serde_json::to_vec(document)?;
        self.add_part("application/json", &json);
        Ok(())
    }

    /// Appends one attachment part.
    pub fn add_attachment(&mut self, content_type: Option<&str>, content: &[u8]) {
        self.add_part(
            content_type.unwrap_or("application/octet-stream"),
            content,
        );
    }

    fn add_part(&mut self, content_type: &str, content: &[u8]) {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body
            .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        self.body
            .extend_from_slice(format!("Content-Length: {}\r\n", content.len()).as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
    }

    /// Seals the body.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}
