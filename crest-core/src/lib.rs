//! Crest Core: client for paginated, cache-friendly CREST collections.
//!
//! This crate contains the protocol plumbing:
//! - Cache port with memory, file and null backends
//! - Transport trait and the reqwest-backed HTTP transport
//! - Envelope: status, headers, body, pagination links, representation, TTL
//! - Single-request executor with cache short-circuit and status classification
//! - Bounded concurrent batch fetcher with rolling window and error budget
//! - Paginated gatherer with result-level caching
//! - Auth providers minted per request

pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod gather;
pub mod http;
pub mod transport;

pub use auth::{AuthProvider, NoAuth, RefreshCredentials, RefreshingToken, StaticToken};
pub use batch::{error_budget, BatchFetcher, BatchJob, BatchReport};
pub use cache::{CacheEntry, CacheKey, CachePort, Cacheable, FileCache, MemoryCache, NullCache};
pub use config::ClientConfig;
pub use envelope::Envelope;
pub use error::{CacheError, CrestError};
pub use executor::{CacheMode, Executor, RequestSpec};
pub use gather::{Collection, Gatherer};
pub use http::HttpTransport;
pub use transport::{HttpRequest, HttpResponse, Transport, Verb};
