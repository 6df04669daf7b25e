//! Error taxonomy for CREST exchanges.
//!
//! Single-request failures surface to the immediate caller. Batch-level
//! aborts (`ServiceUnavailable`, `TooManyErrors`) are meant to be caught one
//! level up, per region, by whatever drives the batch.

use thiserror::Error;

/// Errors raised by the executor, the batch fetcher and the gatherer.
#[derive(Debug, Error)]
pub enum CrestError {
    /// Connection-level failure (DNS, refused, reset, timeout).
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The remote reported HTTP 503.
    #[error("service unavailable (HTTP 503) at {url}")]
    ServiceUnavailable { url: String },

    /// Unexpected status, or a representation the caller did not ask for.
    #[error("protocol error for {url} (status {status}): {reason}")]
    Protocol {
        url: String,
        status: u16,
        reason: String,
    },

    /// The batch error budget was exceeded.
    #[error("too many errors in batch: {errors} failures exceed budget of {budget}")]
    TooManyErrors { errors: usize, budget: usize },

    /// The auth provider could not mint a header.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A response body or a request could not be encoded or decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A batch success callback failed; the batch was aborted.
    #[error("callback failed: {0}")]
    Callback(String),
}

impl CrestError {
    pub fn protocol(url: &str, status: u16, reason: impl Into<String>) -> Self {
        CrestError::Protocol {
            url: url.to_string(),
            status,
            reason: reason.into(),
        }
    }

    /// Whether this error cancels a whole batch rather than a single request.
    pub fn is_batch_abort(&self) -> bool {
        matches!(
            self,
            CrestError::ServiceUnavailable { .. } | CrestError::TooManyErrors { .. }
        )
    }
}

/// Errors raised by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
