//! Single-request executor.
//!
//! One HTTP call (any verb), consulting the cache port first by the request's
//! deterministic key. The real exchange runs only on a miss; the outcome is
//! classified (200/201/302 accepted, 503 service down, anything else a
//! protocol error) and stored when the cache mode allows it.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthHeader, AuthProvider};
use crate::cache::{self, CacheKey, CachePort};
use crate::config::ClientConfig;
use crate::envelope::Envelope;
use crate::error::{CacheError, CrestError};
use crate::transport::{HttpRequest, Transport, Verb};

/// Statuses the single-request path accepts.
pub const ACCEPTED_STATUSES: [u16; 3] = [200, 201, 302];

/// How a request interacts with the cache port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Neither read nor write.
    Bypass,
    /// Serve hits, never store.
    ReadOnly,
    /// Serve hits and store successful exchanges.
    #[default]
    ReadWrite,
}

impl CacheMode {
    pub fn reads(self) -> bool {
        matches!(self, CacheMode::ReadOnly | CacheMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, CacheMode::ReadWrite)
    }
}

/// Everything needed to issue one request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub verb: Verb,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Expected representation tag; also advertised via `Accept`.
    pub representation: Option<String>,
    pub namespace: Option<String>,
    pub cache: CacheMode,
    /// Overrides the client's request timeout.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(verb: Verb, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            verb,
            headers: Vec::new(),
            body: None,
            representation: None,
            namespace: None,
            cache: CacheMode::default(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Verb::Get, url)
    }

    /// POSTs are never cached unless the caller opts back in.
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        let mut spec = Self::new(Verb::Post, url);
        spec.body = Some(body.into());
        spec.cache = CacheMode::Bypass;
        spec
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend_from_slice(headers);
        self
    }

    pub fn expecting(mut self, representation: impl Into<String>) -> Self {
        self.representation = Some(representation.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.cache = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_request(&self.verb, &self.url, self.namespace.as_deref())
    }
}

/// Executes requests through a transport and a cache port.
///
/// Cheap to clone; the transport, cache and auth provider are shared.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CachePort>,
    auth: Option<Arc<dyn AuthProvider>>,
    config: ClientConfig,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn CachePort>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            auth: None,
            config,
        }
    }

    /// Attach a provider consulted for every request this executor sends.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &dyn CachePort {
        self.cache.as_ref()
    }

    pub(crate) fn auth(&self) -> Option<&Arc<dyn AuthProvider>> {
        self.auth.as_ref()
    }

    pub fn execute(&self, spec: &RequestSpec) -> Result<Envelope, CrestError> {
        if spec.cache.reads() {
            if let Some(envelope) = self.lookup(&spec.cache_key()) {
                tracing::debug!(url = %spec.url, verb = %spec.verb, "cache hit");
                return Ok(envelope);
            }
        }

        let auth_header = match &self.auth {
            Some(auth) => auth.auth_header()?,
            None => None,
        };
        let timeout = spec.timeout.unwrap_or_else(|| self.config.request_timeout());
        let request = prepare_request(spec, auth_header, timeout);

        tracing::debug!(url = %spec.url, verb = %spec.verb, "sending request");
        let response = self.transport.send(&request)?;
        let envelope = Envelope::from_response(
            &spec.url,
            spec.verb.clone(),
            spec.namespace.as_deref(),
            response,
            self.config.default_ttl_secs,
        );
        classify(&envelope, &ACCEPTED_STATUSES, spec.representation.as_deref())?;

        if spec.cache.writes() {
            self.remember(&envelope);
        }
        Ok(envelope)
    }

    /// Send a fully prepared request without touching the cache.
    pub(crate) fn send(&self, request: &HttpRequest, spec: &RequestSpec) -> Result<Envelope, CrestError> {
        let response = self.transport.send(request)?;
        Ok(Envelope::from_response(
            &spec.url,
            spec.verb.clone(),
            spec.namespace.as_deref(),
            response,
            self.config.default_ttl_secs,
        ))
    }

    /// Drop the stored envelope of a request, e.g. after an external update.
    pub fn invalidate(&self, verb: &Verb, url: &str, namespace: Option<&str>) -> Result<(), CacheError> {
        self.cache
            .delete(&[CacheKey::for_request(verb, url, namespace)])
    }

    /// Cache read; backend faults degrade to a miss.
    pub(crate) fn lookup(&self, key: &CacheKey) -> Option<Envelope> {
        match cache::load::<Envelope>(self.cache.as_ref(), key) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cache write; backend faults are logged and skipped.
    pub(crate) fn remember(&self, envelope: &Envelope) {
        if let Err(e) = cache::store(self.cache.as_ref(), envelope) {
            tracing::warn!(url = %envelope.url, error = %e, "cache write failed");
        }
    }
}

/// Resolve headers (template, `Accept`, auth) into a concrete request.
pub(crate) fn prepare_request(
    spec: &RequestSpec,
    auth_header: Option<AuthHeader>,
    timeout: Duration,
) -> HttpRequest {
    let mut headers = spec.headers.clone();
    if let Some(repr) = &spec.representation {
        let has_accept = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("accept"));
        if !has_accept {
            let accept = if repr.contains('/') {
                repr.clone()
            } else {
                format!("application/{repr}+json")
            };
            headers.push(("Accept".to_string(), accept));
        }
    }
    if let Some((name, value)) = auth_header {
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        headers.push((name, value));
    }
    HttpRequest {
        verb: spec.verb.clone(),
        url: spec.url.clone(),
        headers,
        body: spec.body.clone(),
        timeout,
    }
}

/// Map an envelope to success or a typed failure.
pub(crate) fn classify(
    envelope: &Envelope,
    accepted: &[u16],
    representation: Option<&str>,
) -> Result<(), CrestError> {
    if envelope.status == 503 {
        return Err(CrestError::ServiceUnavailable {
            url: envelope.url.clone(),
        });
    }
    if !accepted.contains(&envelope.status) {
        return Err(CrestError::protocol(
            &envelope.url,
            envelope.status,
            "unexpected HTTP status",
        ));
    }
    envelope.ensure_representation(representation)
}
