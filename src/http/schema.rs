//! HTTP request/response schemas
//!
//! The schema types describe one captured or mutated HTTP exchange. A
//! `RequestSchema` is produced once per plan as the "original" baseline and
//! N times as mutated variants; it is owned by the plan that created it
//! until handed to the transport collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum RequestBody {
    #[default]
    Empty,
    /// Raw text body
    Raw(String),
    /// Form-encoded parameters (ordered)
    Form(Vec<(String, String)>),
    /// Parsed JSON body
    Json(serde_json::Value),
}

/// An original or mutated HTTP request description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSchema {
    /// HTTP method
    pub method: String,

    /// Full request URL
    pub url: String,

    /// Ordered header name/value pairs (excluding Cookie)
    pub headers: Vec<(String, String)>,

    /// Cookie name/value pairs
    pub cookies: Vec<(String, String)>,

    /// Request body
    pub body: RequestBody,

    /// Free-form metadata (SPA hints, markers)
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl Default for RequestSchema {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: String::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            body: RequestBody::Empty,
            meta: HashMap::new(),
        }
    }
}

impl RequestSchema {
    /// Create a new request schema
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Host portion of the URL
    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default()
    }

    /// Path portion of the URL
    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string())
    }

    /// Decoded query parameter pairs, in URL order
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::Url::parse(&self.url)
            .map(|u| {
                u.query_pairs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the full query string with the given pairs
    pub fn set_query_pairs(&mut self, pairs: &[(String, String)]) {
        if let Ok(mut parsed) = url::Url::parse(&self.url) {
            parsed.set_query(None);
            if !pairs.is_empty() {
                let mut serializer = parsed.query_pairs_mut();
                for (k, v) in pairs {
                    serializer.append_pair(k, v);
                }
                drop(serializer);
            }
            self.url = parsed.to_string();
        }
    }

    /// Append one query parameter, keeping existing ones
    pub fn append_query_pair(&mut self, name: &str, value: &str) {
        if let Ok(mut parsed) = url::Url::parse(&self.url) {
            parsed.query_pairs_mut().append_pair(name, value);
            self.url = parsed.to_string();
        }
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing value (case-insensitive)
    pub fn set_header(&mut self, name: &str, value: &str) {
        let lower = name.to_lowercase();
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.to_lowercase() == lower)
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// The Cookie header value rebuilt from the cookie pairs
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Body serialized to the on-wire text form
    pub fn body_text(&self) -> String {
        match &self.body {
            RequestBody::Empty => String::new(),
            RequestBody::Raw(text) => text.clone(),
            RequestBody::Form(pairs) => pairs
                .iter()
                .map(|(k, v)| {
                    format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                })
                .collect::<Vec<_>>()
                .join("&"),
            RequestBody::Json(value) => value.to_string(),
        }
    }
}

/// HTTP response schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSchema {
    /// HTTP status code (0 for synthetic transport-failure responses)
    pub status: u16,

    /// Status text; carries the error message for synthetic responses
    pub status_text: String,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Vec<u8>,

    /// Response time in milliseconds
    pub duration_ms: u64,
}

impl Default for ResponseSchema {
    fn default() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            duration_ms: 0,
        }
    }
}

impl ResponseSchema {
    /// Synthetic response representing a transport failure
    pub fn transport_failure(message: &str) -> Self {
        Self {
            status: 0,
            status_text: message.to_string(),
            ..Default::default()
        }
    }

    /// Whether this response came from a failed send
    pub fn is_transport_failure(&self) -> bool {
        self.status == 0
    }

    /// Check if response is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response is redirect (3xx)
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Get body as string
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Get a specific header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Get content type header
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Check if content is JSON
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pair_roundtrip() {
        let mut req = RequestSchema::new("GET", "https://example.com/search?q=test&page=1");
        let pairs = req.query_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("q".to_string(), "test".to_string()));

        req.set_query_pairs(&[("q".to_string(), "mutated".to_string())]);
        assert_eq!(
            req.query_pairs(),
            vec![("q".to_string(), "mutated".to_string())]
        );
    }

    #[test]
    fn test_header_case_insensitive() {
        let mut req = RequestSchema::new("GET", "https://example.com/");
        req.set_header("X-Custom", "one");
        req.set_header("x-custom", "two");
        assert_eq!(req.header("X-CUSTOM"), Some("two"));
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_form_body_text() {
        let mut req = RequestSchema::new("POST", "https://example.com/login");
        req.body = RequestBody::Form(vec![
            ("user".to_string(), "a b".to_string()),
            ("pass".to_string(), "x".to_string()),
        ]);
        assert_eq!(req.body_text(), "user=a%20b&pass=x");
    }

    #[test]
    fn test_transport_failure_response() {
        let resp = ResponseSchema::transport_failure("connection refused");
        assert!(resp.is_transport_failure());
        assert!(!resp.is_success());
        assert_eq!(resp.status_text, "connection refused");
    }
}
