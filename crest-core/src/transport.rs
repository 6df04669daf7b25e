//! Transport trait and the plain request/response shapes it exchanges.
//!
//! The `Transport` trait abstracts over the wire so the executor and the batch
//! fetcher can run against reqwest in production and a scripted transport in
//! tests. Transports know nothing about caching or status classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::CrestError;

/// HTTP verb of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
    /// Any other method, sent verbatim (upper-cased).
    Custom(String),
}

impl Verb {
    pub fn as_str(&self) -> &str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Custom(m) => m.as_str(),
        }
    }

    pub fn custom(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Verb::Get,
            "POST" => Verb::Post,
            "PUT" => Verb::Put,
            "DELETE" => Verb::Delete,
            other => Verb::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound HTTP request, fully resolved (headers already minted).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub verb: Verb,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Raw HTTP response. Header names are lower-cased.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

/// Anything able to perform one HTTP exchange.
///
/// Implementations must be shareable across the batch worker threads.
pub trait Transport: Send + Sync {
    /// Perform the exchange. Only connection-level failures are errors here;
    /// every HTTP status, including 5xx, comes back as `Ok`.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, CrestError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, CrestError> {
        (**self).send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_verb_normalizes_known_methods() {
        assert_eq!(Verb::custom("get"), Verb::Get);
        assert_eq!(Verb::custom("Delete"), Verb::Delete);
        assert_eq!(Verb::custom("patch"), Verb::Custom("PATCH".into()));
        assert_eq!(Verb::custom("patch").as_str(), "PATCH");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let resp = HttpResponse {
            status: 200,
            headers,
            body: String::new(),
        };
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        assert_eq!(resp.header("cache-control"), None);
    }
}
