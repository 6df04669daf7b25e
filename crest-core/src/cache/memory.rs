//! In-process cache backend.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{CacheEntry, CacheKey, CachePort};
use crate::error::CacheError;

/// Map-backed cache guarded by a read/write lock.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.write()?.clear();
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>>, CacheError> {
        self.entries
            .read()
            .map_err(|_| CacheError::Io("memory cache lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>>, CacheError> {
        self.entries
            .write()
            .map_err(|_| CacheError::Io("memory cache lock poisoned".into()))
    }
}

impl CachePort for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now();
        Ok(self
            .read()?
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .cloned())
    }

    fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.write()?.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        let mut map = self.write()?;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut map = self.write()?;
        let before = map.len();
        map.retain(|_, e| !e.is_expired_at(now));
        Ok(before - map.len())
    }
}
