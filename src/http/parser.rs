//! Raw HTTP request parsing and fingerprinting
//!
//! Converts captured raw request bytes into a `RequestSchema` (and back),
//! and exposes the canonical fingerprint used for request-queue dedup.

use anyhow::{bail, Context, Result};

use super::schema::{RequestBody, RequestSchema};

/// Metadata key marking a request as SPA-hinted (fingerprint bypass)
pub const META_SPA: &str = "spa";

/// Parse raw request bytes into a request schema.
///
/// Accepts both origin-form (`GET /path HTTP/1.1` + `Host:` header) and
/// absolute-form request targets. The Cookie header is split into pairs;
/// the body is typed by Content-Type.
pub fn parse(raw: &[u8]) -> Result<RequestSchema> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = match text.split_once("\r\n\r\n") {
        Some((h, b)) => (h, b),
        None => match text.split_once("\n\n") {
            Some((h, b)) => (h, b),
            None => (text.as_ref(), ""),
        },
    };

    let mut lines = head.lines();
    let request_line = lines.next().context("Empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("Missing method")?.to_uppercase();
    let target = parts.next().context("Missing request target")?.to_string();

    let mut schema = RequestSchema {
        method,
        ..Default::default()
    };

    let mut host = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        }
        if name.eq_ignore_ascii_case("cookie") {
            for pair in value.split(';') {
                if let Some((ck, cv)) = pair.split_once('=') {
                    schema
                        .cookies
                        .push((ck.trim().to_string(), cv.trim().to_string()));
                }
            }
            continue;
        }
        schema.headers.push((name.to_string(), value.to_string()));
    }

    schema.url = if target.starts_with("http://") || target.starts_with("https://") {
        target
    } else {
        let host = host.context("Missing Host header")?;
        let scheme = if host.ends_with(":80") { "http" } else { "https" };
        format!("{}://{}{}", scheme, host, target)
    };

    if url::Url::parse(&schema.url).is_err() {
        bail!("Invalid request URL: {}", schema.url);
    }

    if !body.is_empty() {
        let content_type = schema.header("content-type").unwrap_or("").to_lowercase();
        schema.body = if content_type.contains("json") {
            match serde_json::from_str(body) {
                Ok(value) => RequestBody::Json(value),
                Err(_) => RequestBody::Raw(body.to_string()),
            }
        } else if content_type.contains("x-www-form-urlencoded") || !content_type.contains('/') {
            RequestBody::Form(parse_form(body))
        } else {
            RequestBody::Raw(body.to_string())
        };
    }

    Ok(schema)
}

/// Serialize a request schema back to raw request bytes
pub fn build(schema: &RequestSchema) -> Vec<u8> {
    let parsed = url::Url::parse(&schema.url).ok();
    let (path_and_query, host) = match &parsed {
        Some(u) => {
            let mut target = u.path().to_string();
            if let Some(q) = u.query() {
                target.push('?');
                target.push_str(q);
            }
            (target, u.host_str().unwrap_or("").to_string())
        }
        None => (schema.url.clone(), String::new()),
    };

    let mut out = format!("{} {} HTTP/1.1\r\n", schema.method, path_and_query);
    if schema.header("host").is_none() && !host.is_empty() {
        out.push_str(&format!("Host: {}\r\n", host));
    }
    for (name, value) in &schema.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !schema.cookies.is_empty() {
        out.push_str(&format!("Cookie: {}\r\n", schema.cookie_header()));
    }
    out.push_str("\r\n");
    out.push_str(&schema.body_text());
    out.into_bytes()
}

/// Canonical dedup fingerprint: method + host + path + sorted query names.
///
/// Query values and body are deliberately ignored so that attacking
/// different values at the same location still dedups by location.
/// SPA-hinted requests bypass canonicalization and key on the full URL,
/// since their attack surface lives in the hash fragment.
pub fn request_fingerprint(schema: &RequestSchema) -> String {
    if schema.meta.contains_key(META_SPA) {
        return format!("{} {}", schema.method, schema.url);
    }

    let mut names: Vec<String> = schema.query_pairs().into_iter().map(|(k, _)| k).collect();
    names.sort();
    format!(
        "{} {}{}?{}",
        schema.method,
        schema.host(),
        schema.path(),
        names.join("&")
    )
}

fn parse_form(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (
                urlencoding::decode(k).map(|s| s.into_owned()).unwrap_or_else(|_| k.to_string()),
                urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.to_string()),
            ),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_request() {
        let raw = b"GET /search?q=test HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nCookie: sid=abc; theme=dark\r\n\r\n";
        let schema = parse(raw).unwrap();
        assert_eq!(schema.method, "GET");
        assert_eq!(schema.url, "https://example.com/search?q=test");
        assert_eq!(schema.header("Accept"), Some("*/*"));
        assert_eq!(schema.cookies.len(), 2);
        assert_eq!(schema.cookies[0], ("sid".to_string(), "abc".to_string()));
    }

    #[test]
    fn test_parse_form_body() {
        let raw = b"POST /login HTTP/1.1\r\nHost: example.com\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nuser=admin&pass=x%20y";
        let schema = parse(raw).unwrap();
        match &schema.body {
            RequestBody::Form(pairs) => {
                assert_eq!(pairs[0], ("user".to_string(), "admin".to_string()));
                assert_eq!(pairs[1], ("pass".to_string(), "x y".to_string()));
            }
            other => panic!("expected form body, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_json_body() {
        let raw = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Type: application/json\r\n\r\n{\"name\":\"test\"}";
        let schema = parse(raw).unwrap();
        assert!(matches!(schema.body, RequestBody::Json(_)));
    }

    #[test]
    fn test_fingerprint_ignores_query_values() {
        let a = RequestSchema::new("GET", "https://example.com/search?q=one&page=1");
        let b = RequestSchema::new("GET", "https://example.com/search?page=2&q=two");
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_differs_on_path_and_method() {
        let a = RequestSchema::new("GET", "https://example.com/search?q=one");
        let b = RequestSchema::new("GET", "https://example.com/other?q=one");
        let c = RequestSchema::new("POST", "https://example.com/search?q=one");
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
        assert_ne!(request_fingerprint(&a), request_fingerprint(&c));
    }

    #[test]
    fn test_spa_fingerprint_bypass() {
        let mut a = RequestSchema::new("GET", "https://example.com/app#/view?id=1");
        a.meta.insert(META_SPA.to_string(), "1".to_string());
        let mut b = RequestSchema::new("GET", "https://example.com/app#/view?id=2");
        b.meta.insert(META_SPA.to_string(), "1".to_string());
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_build_roundtrip() {
        let raw = b"GET /search?q=test HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let schema = parse(raw).unwrap();
        let rebuilt = build(&schema);
        let reparsed = parse(&rebuilt).unwrap();
        assert_eq!(reparsed.url, schema.url);
        assert_eq!(reparsed.method, schema.method);
    }
}
