//! Paginated gather: walk `next` links into one indexed collection.
//!
//! Each item of a page's `items` array goes through an element function
//! (identity by default) for the stored value and an index function (append by
//! default) for its key. Appends keep page-then-in-page order; keyed inserts
//! are last-write-wins and keep the position of the first insert.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::cache::{self, canonical_url, CacheKey, Cacheable};
use crate::envelope::Envelope;
use crate::error::{CacheError, CrestError};
use crate::executor::{Executor, RequestSpec};

/// Maps a raw item to its collection key.
pub type IndexFn<'a> = &'a dyn Fn(&Value) -> String;
/// Maps a raw item to the value stored in the collection.
pub type ElementFn<'a> = &'a dyn Fn(&Value) -> Value;

/// Insertion-ordered keyed collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, Value)>", into = "Vec<(String, Value)>")]
pub struct Collection {
    entries: Vec<(String, Value)>,
    positions: HashMap<String, usize>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append under the next positional key.
    pub fn push(&mut self, value: Value) {
        let key = self.entries.len().to_string();
        self.insert(key, value);
    }

    /// Insert or overwrite in place.
    pub fn insert(&mut self, key: String, value: Value) {
        match self.positions.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.positions.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }
}

impl From<Vec<(String, Value)>> for Collection {
    fn from(entries: Vec<(String, Value)>) -> Self {
        let mut collection = Collection::new();
        for (k, v) in entries {
            collection.insert(k, v);
        }
        collection
    }
}

impl From<Collection> for Vec<(String, Value)> {
    fn from(collection: Collection) -> Self {
        collection.entries
    }
}

/// A gathered collection as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatheredCollection {
    key: CacheKey,
    ttl_secs: u64,
    pub collection: Collection,
}

impl Cacheable for GatheredCollection {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Walks paginated collections through an executor.
#[derive(Clone)]
pub struct Gatherer {
    executor: Executor,
    namespace: Option<String>,
}

impl Gatherer {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn gather(
        &self,
        first_page: &str,
        representation: Option<&str>,
        index: Option<IndexFn<'_>>,
        element: Option<ElementFn<'_>>,
    ) -> Result<Collection, CrestError> {
        let page = self.fetch_page(first_page, representation)?;
        let mut out = Collection::new();
        self.continue_from(&page, representation, index, element, &mut out)?;
        Ok(out)
    }

    /// Absorb an already fetched page, then follow its `next` links.
    pub fn continue_from(
        &self,
        first: &Envelope,
        representation: Option<&str>,
        index: Option<IndexFn<'_>>,
        element: Option<ElementFn<'_>>,
        out: &mut Collection,
    ) -> Result<(), CrestError> {
        let mut visited = HashSet::new();
        visited.insert(canonical_url(&first.url));
        absorb(first, index, element, out)?;

        let mut current = first.next.clone();
        let mut last_status = first.status;
        while let Some(url) = current {
            if !visited.insert(canonical_url(&url)) {
                return Err(CrestError::protocol(&url, last_status, "pagination cycle"));
            }
            let page = self.fetch_page(&url, representation)?;
            absorb(&page, index, element, out)?;
            last_status = page.status;
            current = page.next.clone();
        }
        Ok(())
    }

    /// `gather` memoized under `gathered:{first_page}[#disambiguator]`.
    pub fn gather_cached(
        &self,
        first_page: &str,
        disambiguator: Option<&str>,
        ttl: Duration,
        representation: Option<&str>,
        index: Option<IndexFn<'_>>,
        element: Option<ElementFn<'_>>,
    ) -> Result<Collection, CrestError> {
        let key = CacheKey::gathered(first_page, disambiguator, self.namespace.as_deref());
        match cache::load::<GatheredCollection>(self.executor.cache(), &key) {
            Ok(Some(hit)) => {
                tracing::debug!(key = %key, "gathered collection cache hit");
                return Ok(hit.collection);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "gathered cache read failed"),
        }

        let collection = self.gather(first_page, representation, index, element)?;
        let stored = GatheredCollection {
            key,
            ttl_secs: ttl.as_secs(),
            collection,
        };
        if let Err(e) = cache::store(self.executor.cache(), &stored) {
            tracing::warn!(key = %stored.key, error = %e, "gathered cache write failed");
        }
        Ok(stored.collection)
    }

    pub fn invalidate_gathered(
        &self,
        first_page: &str,
        disambiguator: Option<&str>,
    ) -> Result<(), CacheError> {
        self.executor.cache().delete(&[CacheKey::gathered(
            first_page,
            disambiguator,
            self.namespace.as_deref(),
        )])
    }

    fn fetch_page(&self, url: &str, representation: Option<&str>) -> Result<Envelope, CrestError> {
        let mut spec = RequestSpec::get(url);
        spec.representation = representation.map(str::to_string);
        spec.namespace = self.namespace.clone();
        self.executor.execute(&spec)
    }
}

fn absorb(
    page: &Envelope,
    index: Option<IndexFn<'_>>,
    element: Option<ElementFn<'_>>,
    out: &mut Collection,
) -> Result<(), CrestError> {
    let items = page
        .items()
        .ok_or_else(|| CrestError::protocol(&page.url, page.status, "page has no items array"))?;
    for item in items {
        let value = match element {
            Some(f) => f(item),
            None => item.clone(),
        };
        match index {
            Some(f) => out.insert(f(item), value),
            None => out.push(value),
        }
    }
    Ok(())
}
