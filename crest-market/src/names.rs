//! Region and item names for log lines and reports.
//!
//! Owned by the processor and filled lazily from gathered collections. A
//! miss triggers at most one refresh per kind and run; unknown ids fall back
//! to their number.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crest_core::{CrestError, Gatherer};

/// Which reference collection a name comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Region,
    Item,
}

impl NameKind {
    fn disambiguator(self) -> &'static str {
        match self {
            NameKind::Region => "region-names",
            NameKind::Item => "item-names",
        }
    }
}

/// Id of a collection item: `id`, `id_str`, or the last path segment of `href`.
pub fn item_id(item: &Value) -> Option<u64> {
    if let Some(id) = item.get("id").and_then(Value::as_u64) {
        return Some(id);
    }
    if let Some(id) = item.get("id_str").and_then(Value::as_str).and_then(|s| s.parse().ok()) {
        return Some(id);
    }
    item.get("href")
        .and_then(Value::as_str)?
        .trim_end_matches('/')
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

pub struct NameLookup {
    gatherer: Gatherer,
    sources: HashMap<NameKind, String>,
    ttl: Duration,
    names: HashMap<NameKind, HashMap<u64, String>>,
    refreshed: HashMap<NameKind, bool>,
}

impl NameLookup {
    pub fn new(gatherer: Gatherer, regions_url: impl Into<String>, types_url: impl Into<String>, ttl: Duration) -> Self {
        let mut sources = HashMap::new();
        sources.insert(NameKind::Region, regions_url.into());
        sources.insert(NameKind::Item, types_url.into());
        Self {
            gatherer,
            sources,
            ttl,
            names: HashMap::new(),
            refreshed: HashMap::new(),
        }
    }

    pub fn region(&mut self, id: u64) -> String {
        self.name(NameKind::Region, id)
    }

    pub fn item(&mut self, id: u64) -> String {
        self.name(NameKind::Item, id)
    }

    /// Name for `id`, loading the collection on first miss.
    pub fn name(&mut self, kind: NameKind, id: u64) -> String {
        if let Some(name) = self.cached(kind, id) {
            return name.to_string();
        }
        if !self.refreshed.get(&kind).copied().unwrap_or(false) {
            self.refreshed.insert(kind, true);
            if let Err(e) = self.load(kind, false) {
                tracing::warn!(?kind, error = %e, "name lookup unavailable");
            }
        }
        self.cached(kind, id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    /// Names already known, without any fetch.
    pub fn cached(&self, kind: NameKind, id: u64) -> Option<&str> {
        self.names.get(&kind)?.get(&id).map(String::as_str)
    }

    /// Drop the gathered collection and reload it.
    pub fn refresh(&mut self, kind: NameKind) -> Result<usize, CrestError> {
        self.refreshed.insert(kind, true);
        self.load(kind, true)
    }

    fn load(&mut self, kind: NameKind, force: bool) -> Result<usize, CrestError> {
        let Some(url) = self.sources.get(&kind).cloned() else {
            return Ok(0);
        };
        if force {
            if let Err(e) = self.gatherer.invalidate_gathered(&url, Some(kind.disambiguator())) {
                tracing::warn!(?kind, error = %e, "could not drop cached names");
            }
        }

        let index = |item: &Value| item_id(item).map(|id| id.to_string()).unwrap_or_default();
        let element = |item: &Value| item.get("name").cloned().unwrap_or(Value::Null);
        let collection = self.gatherer.gather_cached(
            &url,
            Some(kind.disambiguator()),
            self.ttl,
            None,
            Some(&index),
            Some(&element),
        )?;

        let table = self.names.entry(kind).or_default();
        table.clear();
        for (key, value) in collection.iter() {
            if let (Ok(id), Some(name)) = (key.parse::<u64>(), value.as_str()) {
                table.insert(id, name.to_string());
            }
        }
        tracing::debug!(?kind, names = table.len(), "loaded names");
        Ok(table.len())
    }
}
