//! TOML application configuration.
//!
//! Every section is optional and defaulted. Secrets can be supplied through
//! `CREST_ACCESS_TOKEN`, `CREST_CLIENT_SECRET` and `CREST_REFRESH_TOKEN`,
//! which override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crest_core::{
    AuthProvider, CachePort, ClientConfig, CrestError, Executor, FileCache, HttpTransport,
    MemoryCache, NullCache, RefreshCredentials, RefreshingToken, StaticToken, Transport,
};

pub const ENV_ACCESS_TOKEN: &str = "CREST_ACCESS_TOKEN";
pub const ENV_CLIENT_SECRET: &str = "CREST_CLIENT_SECRET";
pub const ENV_REFRESH_TOKEN: &str = "CREST_REFRESH_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot set up cache: {0}")]
    Cache(#[from] crest_core::CacheError),

    #[error("cannot set up client: {0}")]
    Client(#[from] CrestError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub market: MarketConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    #[default]
    File,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::File,
            dir: PathBuf::from(".crest-cache"),
        }
    }
}

impl CacheConfig {
    pub fn build(&self) -> Result<Arc<dyn CachePort>, ConfigError> {
        Ok(match self.backend {
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
            CacheBackend::File => Arc::new(FileCache::new(&self.dir)?),
            CacheBackend::None => Arc::new(NullCache),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    None,
    Static,
    Refresh,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub kind: AuthKind,
    pub token: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl AuthConfig {
    /// Build the provider; `executor` carries refresh calls and must be unauthenticated.
    pub fn build(&self, executor: &Executor) -> Result<Option<Arc<dyn AuthProvider>>, ConfigError> {
        match self.kind {
            AuthKind::None => Ok(None),
            AuthKind::Static => {
                let token = required(&self.token, "auth.token")?;
                Ok(Some(Arc::new(StaticToken::new(token))))
            }
            AuthKind::Refresh => {
                let credentials = RefreshCredentials {
                    token_url: required(&self.token_url, "auth.token_url")?,
                    client_id: required(&self.client_id, "auth.client_id")?,
                    client_secret: required(&self.client_secret, "auth.client_secret")?,
                    refresh_token: required(&self.refresh_token, "auth.refresh_token")?,
                };
                Ok(Some(Arc::new(RefreshingToken::new(executor.clone(), credentials))))
            }
        }
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String, ConfigError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Invalid(format!("{name} is required")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Service root; substituted for `{root}` in the URL templates.
    pub root: String,
    /// Template with `{root}`, `{region}` and `{item}`.
    pub orders_url: String,
    pub history_url: String,
    pub regions_url: String,
    pub types_url: String,
    pub orders_representation: Option<String>,
    pub history_representation: Option<String>,
    pub regions: Vec<u64>,
    pub items: Vec<u64>,
    pub flush_interval_ms: u64,
    pub names_ttl_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            root: "https://crest-tq.eveonline.com/".to_string(),
            orders_url: "{root}market/{region}/orders/?type={root}inventory/types/{item}/".to_string(),
            history_url: "{root}market/{region}/history/?type={root}inventory/types/{item}/"
                .to_string(),
            regions_url: "{root}regions/".to_string(),
            types_url: "{root}inventory/types/".to_string(),
            orders_representation: Some("vnd.ccp.eve.MarketOrderCollection-v1".to_string()),
            history_representation: Some("vnd.ccp.eve.MarketTypeHistoryCollection-v1".to_string()),
            regions: vec![10000002],
            items: vec![34],
            flush_interval_ms: 1000,
            names_ttl_secs: 86_400,
        }
    }
}

impl MarketConfig {
    pub fn orders_url(&self, region_id: u64, item_id: u64) -> String {
        self.expand(&self.orders_url, region_id, item_id)
    }

    pub fn history_url(&self, region_id: u64, item_id: u64) -> String {
        self.expand(&self.history_url, region_id, item_id)
    }

    pub fn regions_url(&self) -> String {
        self.regions_url.replace("{root}", &self.root)
    }

    pub fn types_url(&self) -> String {
        self.types_url.replace("{root}", &self.root)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn names_ttl(&self) -> Duration {
        Duration::from_secs(self.names_ttl_secs)
    }

    fn expand(&self, template: &str, region_id: u64, item_id: u64) -> String {
        template
            .replace("{root}", &self.root)
            .replace("{region}", &region_id.to_string())
            .replace("{item}", &item_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crest-market.jsonl"),
        }
    }
}

impl AppConfig {
    /// Read, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override secrets from the environment; `lookup` is usually `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(ENV_ACCESS_TOKEN) {
            self.auth.token = Some(token);
        }
        if let Some(secret) = lookup(ENV_CLIENT_SECRET) {
            self.auth.client_secret = Some(secret);
        }
        if let Some(refresh) = lookup(ENV_REFRESH_TOKEN) {
            self.auth.refresh_token = Some(refresh);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.max_in_flight == 0 {
            return Err(ConfigError::Invalid("client.max_in_flight must be at least 1".into()));
        }
        for (name, template) in [
            ("market.orders_url", &self.market.orders_url),
            ("market.history_url", &self.market.history_url),
        ] {
            if !template.contains("{region}") || !template.contains("{item}") {
                return Err(ConfigError::Invalid(format!(
                    "{name} must contain {{region}} and {{item}}"
                )));
            }
        }
        match self.auth.kind {
            AuthKind::None => {}
            AuthKind::Static => {
                required(&self.auth.token, "auth.token")?;
            }
            AuthKind::Refresh => {
                required(&self.auth.token_url, "auth.token_url")?;
                required(&self.auth.client_id, "auth.client_id")?;
                required(&self.auth.client_secret, "auth.client_secret")?;
                required(&self.auth.refresh_token, "auth.refresh_token")?;
            }
        }
        Ok(())
    }

    /// Executor over the real HTTP transport.
    pub fn connect(&self) -> Result<Executor, ConfigError> {
        let transport = Arc::new(HttpTransport::new(&self.client)?);
        self.executor_with(transport)
    }

    /// Executor over any transport, with the configured cache and auth.
    pub fn executor_with(&self, transport: Arc<dyn Transport>) -> Result<Executor, ConfigError> {
        let cache = self.cache.build()?;
        let base = Executor::new(transport, cache, self.client.clone());
        Ok(match self.auth.build(&base)? {
            Some(auth) => base.with_auth(auth),
            None => base,
        })
    }
}
