//! Cache port: deterministic keys, cacheable items and the backend contract.
//!
//! The core never assumes a backend. A lookup answers `Ok(None)` for a miss,
//! which is the common, expected path and not a fault.

pub mod file;
pub mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::CacheError;
use crate::transport::Verb;

/// Deterministic cache key.
///
/// Request keys are `"{VERB} {canonical_url}"`; gathered collections use
/// `"gathered:{first_page_url}"` with an optional `#disambiguator`. A namespace,
/// when present, is prepended as `"{namespace}|"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(verb: &Verb, url: &str, namespace: Option<&str>) -> Self {
        Self::namespaced(namespace, format!("{} {}", verb.as_str(), canonical_url(url)))
    }

    pub fn gathered(first_page: &str, disambiguator: Option<&str>, namespace: Option<&str>) -> Self {
        let mut raw = format!("gathered:{}", canonical_url(first_page));
        if let Some(d) = disambiguator {
            raw.push('#');
            raw.push_str(d);
        }
        Self::namespaced(namespace, raw)
    }

    /// Wrap an already-built key string (e.g. read back from a backend).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    fn namespaced(namespace: Option<&str>, raw: String) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}|{raw}")),
            _ => Self(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a URL for keying: fragment dropped, query pairs sorted.
///
/// Strings that do not parse as URLs are keyed verbatim (trimmed).
pub fn canonical_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url.trim()) else {
        return url.trim().to_string();
    };
    parsed.set_fragment(None);
    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }
    parsed.to_string()
}

/// A value eligible for caching: it knows its own key and lifetime.
pub trait Cacheable: Serialize + DeserializeOwned {
    fn cache_key(&self) -> CacheKey;
    fn ttl(&self) -> Duration;
}

/// What a backend actually stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: serde_json::Value, ttl: Duration) -> Self {
        let stored_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            key,
            payload,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    pub fn from_item<T: Cacheable>(item: &T) -> Result<Self, CacheError> {
        Ok(Self::new(item.cache_key(), serde_json::to_value(item)?, item.ttl()))
    }

    pub fn decode<T: Cacheable>(&self) -> Result<T, CacheError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Key/value store for cacheable items.
///
/// Backends must tolerate concurrent readers and writers; each key is
/// independently readable and writable, no cross-key transactions.
pub trait CachePort: Send + Sync {
    /// Look up a live entry. Expired entries read as a miss.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store (or replace) an entry under its own key.
    fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove entries. Unknown keys are ignored.
    fn delete(&self, keys: &[CacheKey]) -> Result<(), CacheError>;

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Typed read through a cache port.
pub fn load<T: Cacheable>(cache: &dyn CachePort, key: &CacheKey) -> Result<Option<T>, CacheError> {
    match cache.get(key)? {
        Some(entry) => Ok(Some(entry.decode()?)),
        None => Ok(None),
    }
}

/// Typed write through a cache port.
pub fn store<T: Cacheable>(cache: &dyn CachePort, item: &T) -> Result<(), CacheError> {
    cache.set(CacheEntry::from_item(item)?)
}

/// A cache that never remembers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl CachePort for NullCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    fn set(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    fn delete(&self, _keys: &[CacheKey]) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keys_are_deterministic() {
        let a = CacheKey::for_request(&Verb::Get, "https://crest.example/market/1/?b=2&a=1", None);
        let b = CacheKey::for_request(&Verb::Get, "https://crest.example/market/1/?a=1&b=2", None);
        assert_eq!(a, b);
    }

    #[test]
    fn verbs_do_not_collide() {
        let get = CacheKey::for_request(&Verb::Get, "https://crest.example/x/", None);
        let post = CacheKey::for_request(&Verb::Post, "https://crest.example/x/", None);
        assert_ne!(get, post);
    }

    #[test]
    fn namespaces_separate_keys() {
        let plain = CacheKey::for_request(&Verb::Get, "https://crest.example/x/", None);
        let ns = CacheKey::for_request(&Verb::Get, "https://crest.example/x/", Some("char-42"));
        assert_ne!(plain, ns);
        assert!(ns.as_str().starts_with("char-42|GET "));
    }

    #[test]
    fn fragment_is_ignored() {
        let a = CacheKey::for_request(&Verb::Get, "https://crest.example/x/#top", None);
        let b = CacheKey::for_request(&Verb::Get, "https://crest.example/x/", None);
        assert_eq!(a, b);
    }

    #[test]
    fn gathered_key_carries_disambiguator() {
        let a = CacheKey::gathered("https://crest.example/regions/", None, None);
        let b = CacheKey::gathered("https://crest.example/regions/", Some("byName"), None);
        assert!(a.as_str().starts_with("gathered:"));
        assert!(b.as_str().ends_with("#byName"));
        assert_ne!(a, b);
    }

    #[test]
    fn unparseable_urls_key_verbatim() {
        assert_eq!(canonical_url("  not a url "), "not a url");
    }

    #[test]
    fn null_cache_never_hits() {
        let cache = NullCache;
        let key = CacheKey::from_raw("k");
        cache
            .set(CacheEntry::new(key.clone(), serde_json::json!(1), Duration::from_secs(60)))
            .unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn zero_ttl_entry_is_already_expired() {
        let entry = CacheEntry::new(CacheKey::from_raw("k"), serde_json::json!(1), Duration::ZERO);
        assert!(entry.is_expired());
    }
}
