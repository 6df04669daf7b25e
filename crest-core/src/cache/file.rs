//! File-backed cache backend.
//!
//! Layout: `{cache_dir}/{blake3(key)}.json`, one entry per file.
//!
//! - Atomic writes (write to a unique .tmp, rename into place)
//! - Expired entries are removed when read
//! - Corrupt files are quarantined (`{file}.quarantined`) and read as a miss

use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CacheEntry, CacheKey, CachePort};
use crate::error::CacheError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory of JSON cache entries.
#[derive(Debug)]
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    /// Open (and create if needed) a cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hash = blake3::hash(key.as_str().as_bytes()).to_hex();
        self.cache_dir.join(format!("{hash}.json"))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                let quarantine = path.with_extension("json.quarantined");
                tracing::warn!(path = %path.display(), error = %e, "quarantining corrupt cache file");
                let _ = fs::rename(path, quarantine);
                Ok(None)
            }
        }
    }

    fn remove(path: &Path) -> Result<(), CacheError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let files = self.entry_files()?;
        for path in &files {
            Self::remove(path)?;
        }
        Ok(files.len())
    }

    /// Number of entry files on disk, expired ones included.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entry_files()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

impl CachePort for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(&path)? else {
            return Ok(None);
        };
        // Hash collision or a foreign file under our name.
        if &entry.key != key {
            return Ok(None);
        }
        if entry.is_expired() {
            Self::remove(&path)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.key);
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("json.{}.{n}.tmp", std::process::id()));

        let json = serde_json::to_vec(&entry)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Io(format!("atomic rename failed: {e}"))
        })?;
        Ok(())
    }

    fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        for key in keys {
            Self::remove(&self.entry_path(key))?;
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut removed = 0;
        for path in self.entry_files()? {
            if let Some(entry) = self.read_entry(&path)? {
                if entry.is_expired_at(now) {
                    Self::remove(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
