//! Auth providers.
//!
//! `auth_header()` is called once per outbound request, including every
//! request of a batch, because an access token can expire mid-batch. A
//! provider may perform its own network round-trip to refresh a token.

use serde::Deserialize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::CrestError;
use crate::executor::{CacheMode, Executor, RequestSpec};

/// Header name and value to attach to a request.
pub type AuthHeader = (String, String);

/// Mints an auth header for the next request.
pub trait AuthProvider: Send + Sync {
    fn auth_header(&self) -> Result<Option<AuthHeader>, CrestError>;
}

fn bearer(token: &str) -> AuthHeader {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

/// Anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn auth_header(&self) -> Result<Option<AuthHeader>, CrestError> {
        Ok(None)
    }
}

/// A fixed bearer token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthProvider for StaticToken {
    fn auth_header(&self) -> Result<Option<AuthHeader>, CrestError> {
        Ok(Some(bearer(&self.token)))
    }
}

/// OAuth client credentials plus a long-lived refresh token.
#[derive(Debug, Clone)]
pub struct RefreshCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// Short-lived access tokens minted from a refresh token.
///
/// The current access token is reused until it is within `margin` of its
/// expiry; the next caller after that performs the refresh. The lock is held
/// across the refresh so concurrent batch workers trigger one refresh only.
pub struct RefreshingToken {
    executor: Executor,
    credentials: RefreshCredentials,
    margin: Duration,
    current: Mutex<Option<AccessToken>>,
}

impl RefreshingToken {
    /// `executor` must not itself carry this provider.
    pub fn new(executor: Executor, credentials: RefreshCredentials) -> Self {
        Self {
            executor,
            credentials,
            margin: Duration::from_secs(30),
            current: Mutex::new(None),
        }
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    fn refresh(&self) -> Result<AccessToken, CrestError> {
        let body = form_encode(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &self.credentials.refresh_token),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
        ])?;
        let spec = RequestSpec::post(&self.credentials.token_url, body)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .cache(CacheMode::Bypass);

        let envelope = self
            .executor
            .execute(&spec)
            .map_err(|e| CrestError::Auth(format!("token refresh failed: {e}")))?;
        let parsed: TokenResponse = serde_json::from_value(envelope.body)
            .map_err(|e| CrestError::Auth(format!("malformed token response: {e}")))?;

        tracing::debug!(expires_in = ?parsed.expires_in, "access token refreshed");
        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(envelope.ttl_secs));
        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

impl AuthProvider for RefreshingToken {
    fn auth_header(&self) -> Result<Option<AuthHeader>, CrestError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = current.as_ref() {
            if Instant::now() + self.margin < token.expires_at {
                return Ok(Some(bearer(&token.token)));
            }
        }
        let fresh = self.refresh()?;
        let header = bearer(&fresh.token);
        *current = Some(fresh);
        Ok(Some(header))
    }
}

/// `application/x-www-form-urlencoded` encoding of key/value pairs.
fn form_encode(pairs: &[(&str, &str)]) -> Result<String, CrestError> {
    let url = reqwest::Url::parse_with_params("http://localhost/", pairs)
        .map_err(|e| CrestError::Auth(format!("cannot encode token request: {e}")))?;
    Ok(url.query().unwrap_or_default().to_string())
}
