//! The on-disk blob store.

use crate::error::{BlobError, BlobResult};
use crate::key::BlobKey;
use crate::writer::BlobWriter;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

const BLOB_EXTENSION: &str = "blob";
const TMP_DIR: &str = "tmp";

/// A directory of attachment bodies addressed by content hash.
///
/// # Thread Safety
///
/// All operations are idempotent per key: two threads storing the same
/// content race harmlessly, because the rename-based install treats an
/// existing target as the canonical copy.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    /// Opens or creates a blob store rooted at `dir`.
    pub fn open(dir: &Path) -> BlobResult<Self> {
        let tmp_dir = dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            tmp_dir,
        })
    }

    /// The root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory where in-flight temp files live.
    #[must_use]
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The path a blob with this key lives at. Pure: same key, same path.
    #[must_use]
    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), BLOB_EXTENSION))
    }

    /// Stores `content` and returns its key and length.
    ///
    /// Writes via a temp file and an atomic rename; storing content that is
    /// already present is a no-op beyond hashing it.
    pub fn store_blob(&self, content: &[u8]) -> BlobResult<(BlobKey, u64)> {
        let mut writer = self.writer()?;
        writer.append(content)?;
        let key = writer.finish()?;
        let length = writer.length();
        writer.install()?;
        Ok((key, length))
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&self, key: &BlobKey) -> BlobResult<File> {
        let path = self.path_for(key);
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(key.to_hex())
            } else {
                BlobError::Io(e)
            }
        })
    }

    /// Reads a whole blob into memory.
    pub fn blob_contents(&self, key: &BlobKey) -> BlobResult<Vec<u8>> {
        let mut file = self.open_blob(key)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Returns the stored length of a blob.
    pub fn blob_length(&self, key: &BlobKey) -> BlobResult<u64> {
        let meta = fs::metadata(self.path_for(key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(key.to_hex())
            } else {
                BlobError::Io(e)
            }
        })?;
        Ok(meta.len())
    }

    /// Whether a blob with this key is present.
    #[must_use]
    pub fn has_blob(&self, key: &BlobKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Removes a blob. Removing an absent blob is not an error.
    pub fn delete_blob(&self, key: &BlobKey) -> BlobResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    /// Re-hashes a stored blob and checks it against its key.
    pub fn verify(&self, key: &BlobKey) -> BlobResult<()> {
        let contents = self.blob_contents(key)?;
        if BlobKey::of(&contents) == *key {
            Ok(())
        } else {
            Err(BlobError::Corrupt(key.to_hex()))
        }
    }

    /// Number of blobs in the store.
    pub fn count(&self) -> BlobResult<usize> {
        Ok(self.blob_keys()?.len())
    }

    /// Total size in bytes of all stored blobs.
    pub fn total_size(&self) -> BlobResult<u64> {
        let mut total = 0;
        for key in self.blob_keys()? {
            total += self.blob_length(&key)?;
        }
        Ok(total)
    }

    /// Enumerates the keys of every stored blob.
    pub fn blob_keys(&self) -> BlobResult<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(key) = BlobKey::from_hex(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Starts a streaming writer into this store.
    pub fn writer(&self) -> BlobResult<BlobWriter> {
        BlobWriter::new(self)
    }
}
