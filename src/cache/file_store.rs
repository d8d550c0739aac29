//! File-backed cache store
//!
//! Each entry is stored as one JSON row file named after its identity key.
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so readers never observe a half-written entry and
//! concurrent writers to the same key resolve to the last rename.

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::row::Row;
use super::store::{CacheEntry, CacheStore, StoreError};

/// Application name used for the XDG cache directory
pub const APP_NAME: &str = "staleguard";

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Stores cache entries as files in a directory
///
/// The default location is XDG-compliant (`~/.cache/staleguard/<database>/`
/// on Linux).
#[derive(Debug)]
pub struct FileStore {
    /// Directory where entry files are stored
    dir: PathBuf,
    /// Sequence used to give temp files unique names
    write_seq: AtomicU64,
}

impl FileStore {
    /// Creates a FileStore for `database` under the XDG cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new(database: &str) -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", APP_NAME)?;
        Some(Self::with_dir(project_dirs.cache_dir().join(database)))
    }

    /// Creates a FileStore rooted at a custom directory
    ///
    /// Useful for testing or when a specific cache location is needed.
    pub fn with_dir(dir: PathBuf) -> Self {
        Self {
            dir,
            write_seq: AtomicU64::new(0),
        }
    }

    /// Directory holding the entry files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path to the entry file for the given key
    fn entry_path(&self, identity_key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", identity_key, ENTRY_EXTENSION))
    }

    /// Ensures the store directory exists
    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    fn read_entry(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row: Row = serde_json::from_slice(&content)?;
        CacheEntry::from_row(row).map(Some)
    }

    /// Lists entry files, skipping temp files and foreign files
    fn entry_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.files_with_extension(ENTRY_EXTENSION)
    }

    fn files_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>, StoreError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Removes every entry file matching `predicate`
    ///
    /// Unreadable entries are removed too, since they can never be served.
    fn remove_where<F>(&self, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        for path in self.entry_files()? {
            let matches = match Self::read_entry(&path) {
                Ok(Some(entry)) => predicate(&entry),
                Ok(None) => false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable cache entry");
                    true
                }
            };
            if matches && remove_file(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Deletes a file, treating an already-missing file as not removed
fn remove_file(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl CacheStore for FileStore {
    fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Self::read_entry(&self.entry_path(identity_key))
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let json = serde_json::to_vec(&entry.to_row())?;
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self.dir.join(format!(
            "{}.{}.{}.{}",
            entry.identity_key,
            std::process::id(),
            seq,
            TEMP_EXTENSION
        ));

        let written = fs::write(&temp_path, json)
            .and_then(|()| fs::rename(&temp_path, self.entry_path(&entry.identity_key)));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!(key = %entry.identity_key, "Wrote cache entry");
        Ok(())
    }

    fn evict_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.remove_where(|entry| entry.is_older_than(max_age, now))
    }

    fn clear(&self, identity_key: &str) -> Result<bool, StoreError> {
        remove_file(&self.entry_path(identity_key))
    }

    fn clear_type(&self, response_type: &str) -> Result<usize, StoreError> {
        self.remove_where(|entry| entry.response_type == response_type)
    }

    fn expire_type(&self, response_type: &str) -> Result<usize, StoreError> {
        let mut expired = 0;
        for path in self.entry_files()? {
            let entry = match Self::read_entry(&path) {
                Ok(Some(entry)) if entry.response_type == response_type => entry,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                    continue;
                }
            };
            self.put(CacheEntry {
                cached_at: DateTime::UNIX_EPOCH,
                ..entry
            })?;
            expired += 1;
        }
        Ok(expired)
    }

    /// Removes every entry, plus temp files left behind by interrupted writes
    fn clear_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in self.entry_files()? {
            if remove_file(&path)? {
                removed += 1;
            }
        }
        for path in self.files_with_extension(TEMP_EXTENSION)? {
            debug!(path = %path.display(), "Removing leftover temp file");
            remove_file(&path)?;
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entry_files()?.len())
    }
}
