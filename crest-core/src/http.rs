//! reqwest-backed transport.
//!
//! Redirects are not followed: a 302 is an accepted outcome of the protocol
//! and must reach the executor as-is.

use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use std::collections::BTreeMap;

use crate::config::ClientConfig;
use crate::error::CrestError;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Blocking HTTP transport over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, CrestError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(Policy::none())
            .build()
            .map_err(|e| CrestError::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, CrestError> {
        let method = reqwest::Method::from_bytes(request.verb.as_str().as_bytes())
            .map_err(|e| CrestError::Decode(format!("invalid HTTP verb {}: {e}", request.verb)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().map_err(|e| CrestError::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        })?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            // Non-UTF-8 header values are of no use to the protocol.
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = resp.text().map_err(|e| CrestError::Transport {
            url: request.url.clone(),
            message: format!("failed to read body: {e}"),
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
