//! Streaming blob writer.

use crate::error::{BlobError, BlobResult};
use crate::key::BlobKey;
use crate::store::BlobStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Md5;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::debug;

/// Streams a large attachment into a [`BlobStore`], e.g. from a network
/// download.
///
/// Data is appended incrementally while SHA-1 and MD5 digests are updated;
/// `finish()` seals the temp file and fixes the key; `install()` renames it
/// into the store. Dropping the writer without installing unlinks the temp
/// file.
pub struct BlobWriter {
    temp: Option<NamedTempFile>,
    sha1: Sha1,
    md5: Md5,
    length: u64,
    key: Option<BlobKey>,
    md5_digest: Option<[u8; 16]>,
    dest: Option<PathBuf>,
    store_dir: PathBuf,
}

impl BlobWriter {
    pub(crate) fn new(store: &BlobStore) -> BlobResult<Self> {
        let temp = tempfile::Builder::new()
            .prefix(&uuid::Uuid::new_v4().simple().to_string())
            .suffix(".blobtmp")
            .tempfile_in(store.tmp_dir())?;
        Ok(Self {
            temp: Some(temp),
            sha1: Sha1::new(),
            md5: Md5::new(),
            length: 0,
            key: None,
            md5_digest: None,
            dest: None,
            store_dir: store.dir().to_path_buf(),
        })
    }

    /// Appends data to the blob. Call this as new data arrives.
    pub fn append(&mut self, data: &[u8]) -> BlobResult<()> {
        if self.key.is_some() {
            return Err(BlobError::WriterState("append after finish"));
        }
        let temp = self
            .temp
            .as_mut()
            .ok_or(BlobError::WriterState("append after install or cancel"))?;
        temp.write_all(data)?;
        self.sha1.update(data);
        self.md5.update(data);
        self.length += data.len() as u64;
        Ok(())
    }

    /// Seals the temp file and records the digests. Call after all data has
    /// been appended.
    pub fn finish(&mut self) -> BlobResult<BlobKey> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        let temp = self
            .temp
            .as_mut()
            .ok_or(BlobError::WriterState("finish after install or cancel"))?;
        temp.flush()?;
        temp.as_file().sync_all()?;

        let key = BlobKey::from_bytes(self.sha1.clone().finalize().into());
        self.md5_digest = Some(self.md5.clone().finalize().into());
        self.key = Some(key);
        self.dest = Some(
            self.store_dir
                .join(format!("{}.blob", key.to_hex())),
        );
        Ok(key)
    }

    /// Installs the finished blob into the store.
    ///
    /// If the rename fails because the target exists, the existing file must
    /// hold identical content (same key, same bytes), so the temp is
    /// discarded and the install still succeeds.
    pub fn install(&mut self) -> BlobResult<()> {
        let Some(temp) = self.temp.take() else {
            return Ok(()); // already installed
        };
        let dest = self
            .dest
            .clone()
            .ok_or(BlobError::WriterState("install before finish"))?;
        match temp.persist_noclobber(&dest) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %dest.display(), "blob already present, discarding temp");
                // NamedTempFile inside the error unlinks itself on drop.
                Ok(())
            }
            Err(e) => Err(BlobError::Io(e.error)),
        }
    }

    /// Abandons the write and unlinks the temp file.
    pub fn cancel(mut self) {
        self.temp.take(); // drop unlinks
    }

    /// Number of bytes appended so far.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The blob key, available after `finish()`.
    #[must_use]
    pub fn key(&self) -> Option<BlobKey> {
        self.key
    }

    /// The `sha1-<base64>` digest string, available after `finish()`.
    #[must_use]
    pub fn sha1_digest_string(&self) -> Option<String> {
        self.key.map(|k| k.digest_string())
    }

    /// The `md5-<base64>` digest string, available after `finish()`.
    #[must_use]
    pub fn md5_digest_string(&self) -> Option<String> {
        self.md5_digest
            .as_ref()
            .map(|d| format!("md5-{}", BASE64.encode(d)))
    }
}
