//! HTTP transport collaborator
//!
//! The engine never talks to the network directly; it hands a
//! `RequestSchema` to a `Transport` and gets a `ResponseSchema` back.
//! Transport failures are converted into synthetic responses at this
//! boundary and never thrown past the task executor.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::schema::{RequestSchema, ResponseSchema};
use crate::error::TransportError;

/// Transport collaborator boundary
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the response. Network errors are reported
    /// as synthetic responses carrying the error message as status text.
    async fn send(&self, request: &RequestSchema) -> ResponseSchema;
}

/// Options for the reqwest-backed transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// Headers applied to every outgoing request, overriding schema values
    pub header_overrides: Vec<(String, String)>,

    /// User agent string
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            follow_redirects: true,
            header_overrides: Vec::new(),
            user_agent: format!("Vastra/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Create a new transport
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .user_agent(&config.user_agent)
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    async fn execute(&self, request: &RequestSchema) -> Result<ResponseSchema, TransportError> {
        let start = Instant::now();

        let method = reqwest::Method::from_str(&request.method)
            .map_err(|_| TransportError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, &request.url);

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            if let (Ok(name), Ok(val)) =
                (HeaderName::from_str(key), HeaderValue::from_str(value))
            {
                headers.insert(name, val);
            }
        }
        if !request.cookies.is_empty() {
            if let Ok(val) = HeaderValue::from_str(&request.cookie_header()) {
                headers.insert(reqwest::header::COOKIE, val);
            }
        }
        for (key, value) in &self.config.header_overrides {
            if let (Ok(name), Ok(val)) =
                (HeaderName::from_str(key), HeaderValue::from_str(value))
            {
                headers.insert(name, val);
            }
        }
        builder = builder.headers(headers);

        let body_text = request.body_text();
        if !body_text.is_empty() {
            builder = builder.body(body_text);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.config.timeout_ms)
            } else {
                TransportError::RequestFailed(e.to_string())
            }
        })?;
        let duration = start.elapsed();

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();

        let mut resp_headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                resp_headers.insert(key.as_str().to_string(), v.to_string());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        Ok(ResponseSchema {
            status,
            status_text,
            headers: resp_headers,
            body: body.to_vec(),
            duration_ms: duration.as_millis() as u64,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestSchema) -> ResponseSchema {
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Transport failure");
                ResponseSchema::transport_failure(&e.to_string())
            }
        }
    }
}

/// Coordinates shared transport state across workers.
///
/// Holds a bounded TTL cache of stored headers and a serialization lock for
/// operations that must not interleave. Passed by reference instead of being
/// reached through static state.
pub struct TransportCoordinator {
    stored_headers: Mutex<HashMap<String, (Instant, Vec<(String, String)>)>>,
    serialize: tokio::sync::Mutex<()>,
    ttl: Duration,
    capacity: usize,
}

impl TransportCoordinator {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            stored_headers: Mutex::new(HashMap::new()),
            serialize: tokio::sync::Mutex::new(()),
            ttl,
            capacity,
        }
    }

    /// Remember headers for a host; evicts expired entries first
    pub fn store_headers(&self, host: &str, headers: Vec<(String, String)>) {
        let mut map = self.stored_headers.lock();
        let now = Instant::now();
        map.retain(|_, (stored, _)| now.duration_since(*stored) < self.ttl);
        if map.len() >= self.capacity && !map.contains_key(host) {
            return;
        }
        map.insert(host.to_string(), (now, headers));
    }

    /// Retrieve non-expired headers for a host
    pub fn stored_headers(&self, host: &str) -> Option<Vec<(String, String)>> {
        let map = self.stored_headers.lock();
        map.get(host).and_then(|(stored, headers)| {
            if stored.elapsed() < self.ttl {
                Some(headers.clone())
            } else {
                None
            }
        })
    }

    /// Run a closure while holding the serialization lock
    pub async fn serialized<F, T>(&self, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.serialize.lock().await;
        f.await
    }
}

impl Default for TransportCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_creation() {
        let transport = HttpTransport::new(TransportConfig::default());
        assert!(transport.is_ok());
    }

    #[test]
    fn test_coordinator_ttl() {
        let coordinator = TransportCoordinator::new(Duration::from_millis(0), 8);
        coordinator.store_headers("example.com", vec![("X-A".into(), "1".into())]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(coordinator.stored_headers("example.com").is_none());
    }

    #[test]
    fn test_coordinator_capacity() {
        let coordinator = TransportCoordinator::new(Duration::from_secs(60), 1);
        coordinator.store_headers("a.com", vec![]);
        coordinator.store_headers("b.com", vec![]);
        assert!(coordinator.stored_headers("a.com").is_some());
        assert!(coordinator.stored_headers("b.com").is_none());
    }
}
