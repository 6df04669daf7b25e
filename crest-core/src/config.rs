//! Client-side tuning knobs shared by the executor and the batch fetcher.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TTL applied when a response carries neither `expires_in` nor
/// `Cache-Control: max-age`.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Upper bound on simultaneous in-flight requests in a batch.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Total timeout of a single executor request.
    pub request_timeout_secs: u64,
    /// Total timeout of one request inside a batch.
    pub batch_timeout_secs: u64,
    pub max_in_flight: usize,
    pub default_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("crestmarket/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            batch_timeout_secs: 20,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}
