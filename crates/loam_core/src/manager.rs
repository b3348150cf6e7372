//! Top-level manager: database directory, naming rules, shared executor.
//!
//! Layout of a manager directory:
//!
//! ```text
//! <dir>/
//! ├─ LOCK                      # advisory lock, one manager per directory
//! ├─ projects.cblite           # database file for "projects"
//! ├─ inbox:2024.cblite         # database "inbox/2024" ('/' stored as ':')
//! └─ projects attachments/     # blob store for "projects"
//! ```

use crate::error::{CoreError, CoreResult};
use crate::executor::WorkExecutor;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// File suffix for database files.
pub const DATABASE_SUFFIX: &str = ".cblite";
/// Suffix used by the legacy format; renamed on open.
pub const DATABASE_SUFFIX_OLD: &str = ".touchdb";

const LOCK_FILE: &str = "LOCK";
const MAX_NAME_LENGTH: usize = 239;

/// Manages a directory of databases: naming, paths, the shared work
/// executor, and the replication session counter.
pub struct Manager {
    dir: PathBuf,
    _lock_file: File,
    executor: WorkExecutor,
    session_counter: Arc<AtomicU32>,
}

impl Manager {
    /// Opens a manager over `dir`, creating it if needed.
    ///
    /// Acquires an exclusive advisory lock on the directory and renames any
    /// legacy database files to the current suffix.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirectoryLocked);
        }

        upgrade_legacy_files(dir)?;
        info!(dir = %dir.display(), "opened database manager");

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
            executor: WorkExecutor::new("manager"),
            session_counter: Arc::new(AtomicU32::new(0)),
        })
    }

    /// The manager's root directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// The shared single-threaded work executor.
    #[must_use]
    pub fn executor(&self) -> &WorkExecutor {
        &self.executor
    }

    /// The shared replication session counter. Each replication draws a
    /// session id like `repl001` from it.
    #[must_use]
    pub fn session_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.session_counter)
    }

    /// Draws the next replication session id.
    #[must_use]
    pub fn next_session_id(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("repl{n:03}")
    }

    /// Whether `name` is a legal database name: 1–239 characters from
    /// `[a-z0-9_$()+-/]`, starting with a lowercase letter.
    #[must_use]
    pub fn is_valid_database_name(name: &str) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return false;
        }
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !first.is_ascii_lowercase() {
            return false;
        }
        name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
        })
    }

    /// Maps a database name to its file path. `/` in names is stored as `:`.
    pub fn path_for_name(&self, name: &str) -> CoreResult<PathBuf> {
        if !Self::is_valid_database_name(name) {
            return Err(CoreError::InvalidName(name.to_string()));
        }
        let file_name = name.replace('/', ":");
        Ok(self.dir.join(format!("{file_name}{DATABASE_SUFFIX}")))
    }

    /// Directory for the blob store of a database.
    pub fn attachment_store_path(&self, name: &str) -> CoreResult<PathBuf> {
        if !Self::is_valid_database_name(name) {
            return Err(CoreError::InvalidName(name.to_string()));
        }
        let file_name = name.replace('/', ":");
        Ok(self.dir.join(format!("{file_name} attachments")))
    }

    /// Names of all databases present in the directory, sorted.
    pub fn all_database_names(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(DATABASE_SUFFIX) {
                names.push(stem.replace(':', "/"));
            }
        }
        names.sort();
        Ok(names)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").field("dir", &self.dir).finish()
    }
}

/// Renames `<name>.touchdb` files to `<name>.cblite`. A collision with an
/// existing target is skipped with a warning.
fn upgrade_legacy_files(dir: &Path) -> CoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(DATABASE_SUFFIX_OLD) else {
            continue;
        };
        let target = dir.join(format!("{stem}{DATABASE_SUFFIX}"));
        if target.exists() {
            warn!(
                from = file_name,
                to = %target.display(),
                "not upgrading legacy database file, target already exists"
            );
            continue;
        }
        fs::rename(entry.path(), &target)?;
        info!(from = file_name, to = %target.display(), "upgraded legacy database file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn valid_names() {
        for name in ["a", "db1", "my_db", "scratch$(2)", "inbox/2024", "a-b+c"] {
            assert!(Manager::is_valid_database_name(name), "{name}");
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "B", "1db", "_db", "name with space", "UPPER", "päron"] {
            assert!(!Manager::is_valid_database_name(name), "{name:?}");
        }
        assert!(!Manager::is_valid_database_name(&"a".repeat(240)));
        assert!(Manager::is_valid_database_name(&"a".repeat(239)));
    }

    #[test]
    fn path_maps_slash_to_colon() {
        let dir = tempdir().unwrap();
        let manager = Manager::open(dir.path()).unwrap();
        let path = manager.path_for_name("inbox/2024").unwrap();
        assert!(path.to_string_lossy().ends_with("inbox:2024.cblite"));
    }

    #[test]
    fn invalid_name_rejected_for_paths() {
        let dir = tempdir().unwrap();
        let manager = Manager::open(dir.path()).unwrap();
        assert!(matches!(
            manager.path_for_name("Bad"),
            Err(CoreError::InvalidName(_))
        ));
    }

    #[test]
    fn legacy_files_upgraded_on_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.touchdb"), b"payload").unwrap();
        let manager = Manager::open(dir.path()).unwrap();
        assert!(dir.path().join("old.cblite").exists());
        assert!(!dir.path().join("old.touchdb").exists());
        assert_eq!(manager.all_database_names().unwrap(), vec!["old"]);
    }

    #[test]
    fn legacy_upgrade_skips_collisions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("db.touchdb"), b"legacy").unwrap();
        fs::write(dir.path().join("db.cblite"), b"current").unwrap();
        Manager::open(dir.path()).unwrap();
        // Both survive; the legacy file is left alone.
        assert!(dir.path().join("db.touchdb").exists());
        assert_eq!(fs::read(dir.path().join("db.cblite")).unwrap(), b"current");
    }

    #[test]
    fn directory_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let _first = Manager::open(dir.path()).unwrap();
        assert!(matches!(
            Manager::open(dir.path()),
            Err(CoreError::DirectoryLocked)
        ));
    }

    #[test]
    fn database_names_enumerated_sorted() {
        let dir = tempdir().unwrap();
        let manager = Manager::open(dir.path()).unwrap();
        fs::write(dir.path().join("zoo.cblite"), b"").unwrap();
        fs::write(dir.path().join("apple.cblite"), b"").unwrap();
        fs::write(dir.path().join("sub:db.cblite"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        assert_eq!(
            manager.all_database_names().unwrap(),
            vec!["apple", "sub/db", "zoo"]
        );
    }

    #[test]
    fn session_ids_are_sequential() {
        let dir = tempdir().unwrap();
        let manager = Manager::open(dir.path()).unwrap();
        assert_eq!(manager.next_session_id(), "repl001");
        assert_eq!(manager.next_session_id(), "repl002");
    }
}
