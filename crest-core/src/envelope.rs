//! Envelope: one exchange's normalized result.
//!
//! Captures status, headers, raw and decoded body, pagination links, the
//! representation tag and a TTL hint. A cached envelope and a freshly fetched
//! one are interchangeable for callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{CacheKey, Cacheable};
use crate::error::CrestError;
use crate::transport::{HttpResponse, Verb};

/// Normalized HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub url: String,
    pub verb: Verb,
    pub namespace: Option<String>,
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub raw_body: String,
    /// Decoded JSON body; `Null` when the body is empty or not JSON.
    pub body: Value,
    /// Content subtype, e.g. `vnd.ccp.eve.MarketOrderCollection-v1`.
    pub representation: Option<String>,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub ttl_secs: u64,
    pub fetched_at: DateTime<Utc>,
}

impl Envelope {
    pub fn from_response(
        url: &str,
        verb: Verb,
        namespace: Option<&str>,
        response: HttpResponse,
        default_ttl_secs: u64,
    ) -> Self {
        let body = decode_body(&response.body);
        let representation = response.header("content-type").and_then(representation_of);
        let ttl_secs = ttl_hint(&body, response.header("cache-control"), default_ttl_secs);
        let next = link_href(&body, "next");
        let previous = link_href(&body, "previous");

        Self {
            url: url.to_string(),
            verb,
            namespace: namespace.map(str::to_string),
            status: response.status,
            headers: response.headers,
            raw_body: response.body,
            body,
            representation,
            next,
            previous,
            ttl_secs,
            fetched_at: Utc::now(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Items of a collection page, if the body is one.
    pub fn items(&self) -> Option<&Vec<Value>> {
        self.body.get("items").and_then(Value::as_array)
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Fail with a protocol error unless the representation matches `expected`.
    pub fn ensure_representation(&self, expected: Option<&str>) -> Result<(), CrestError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let want = normalize_representation(expected);
        match &self.representation {
            Some(got) if normalize_representation(got) == want => Ok(()),
            got => Err(CrestError::protocol(
                &self.url,
                self.status,
                format!(
                    "representation mismatch: expected {want}, got {}",
                    got.as_deref().unwrap_or("none")
                ),
            )),
        }
    }
}

impl Cacheable for Envelope {
    fn cache_key(&self) -> CacheKey {
        CacheKey::for_request(&self.verb, &self.url, self.namespace.as_deref())
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn decode_body(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

/// Extract the content subtype from a `Content-Type` header value.
///
/// `application/vnd.ccp.eve.Api-v3+json; charset=utf-8` -> `vnd.ccp.eve.Api-v3`.
pub fn representation_of(content_type: &str) -> Option<String> {
    let tag = normalize_representation(content_type);
    (!tag.is_empty()).then_some(tag)
}

fn normalize_representation(value: &str) -> String {
    let media = value.split(';').next().unwrap_or("").trim();
    let subtype = media.rsplit_once('/').map_or(media, |(_, s)| s);
    subtype
        .strip_suffix("+json")
        .unwrap_or(subtype)
        .trim()
        .to_string()
}

/// TTL priority: body `expires_in`, then `Cache-Control: max-age`, then default.
pub fn ttl_hint(body: &Value, cache_control: Option<&str>, default_secs: u64) -> u64 {
    if let Some(expires_in) = body.get("expires_in") {
        if let Some(secs) = expires_in.as_u64() {
            return secs;
        }
        if let Some(secs) = expires_in.as_f64() {
            return secs.max(0.0) as u64;
        }
    }
    cache_control
        .and_then(max_age)
        .unwrap_or(default_secs)
}

fn max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse().ok()
        } else {
            None
        }
    })
}

/// Pagination link: `{"next": {"href": "..."}}` or `{"next": "..."}`.
fn link_href(body: &Value, name: &str) -> Option<String> {
    match body.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(o) => o
            .get("href")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
