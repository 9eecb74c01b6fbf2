//! In-browser check collaborator
//!
//! SPA attacks probe client-side vulnerabilities exposed via URL
//! hash-fragment parameters. The actual browser automation lives behind
//! this trait; the engine only ships the URL/param/payload/check-list over
//! and consumes the per-check outcomes. The executor wraps calls in a hard
//! timeout so a hung page resolves to "no result" instead of stalling a
//! worker.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The fixed battery of in-browser checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaCheck {
    /// DOM-based XSS payload execution
    DomXss,
    /// Unvalidated redirect triggered from the fragment
    Redirect,
    /// Injected JavaScript execution
    InjectedJs,
    /// Token exposed through the fragment
    FragmentToken,
    /// Token leaked to a third-party origin
    ThirdPartyToken,
    /// Sensitive data written to local/session storage
    StorageLeak,
    /// Data leaked via postMessage
    PostMessageLeak,
    /// Sensitive data present in the fragment itself
    SensitiveFragment,
}

impl SpaCheck {
    pub fn name(&self) -> &'static str {
        match self {
            SpaCheck::DomXss => "dom-xss",
            SpaCheck::Redirect => "redirect",
            SpaCheck::InjectedJs => "injected-js",
            SpaCheck::FragmentToken => "fragment-token",
            SpaCheck::ThirdPartyToken => "third-party-token",
            SpaCheck::StorageLeak => "storage-leak",
            SpaCheck::PostMessageLeak => "post-message-leak",
            SpaCheck::SensitiveFragment => "sensitive-fragment",
        }
    }
}

/// Outcome of one in-browser check
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckOutcome {
    /// Whether the check found the page vulnerable
    pub vulnerable: bool,

    /// Supporting evidence captured in the page
    pub evidence: Option<String>,
}

/// The in-browser check request handed to the collaborator
#[derive(Debug, Clone)]
pub struct SpaCheckRequest {
    /// URL with the payload already substituted into the fragment
    pub url: String,

    /// Hash-fragment parameter under attack
    pub param: String,

    /// Injected payload
    pub payload: String,

    /// Checks to run
    pub checks: Vec<SpaCheck>,
}

/// Browser collaborator boundary. Implementations open an isolated browser
/// context, run the requested checks, and tear the context down regardless
/// of outcome.
#[async_trait]
pub trait BrowserChecks: Send + Sync {
    async fn run_checks(&self, request: SpaCheckRequest) -> HashMap<SpaCheck, CheckOutcome>;
}

/// Default collaborator used when no browser is wired up: every check
/// reports no result.
pub struct NoBrowser;

#[async_trait]
impl BrowserChecks for NoBrowser {
    async fn run_checks(&self, _request: SpaCheckRequest) -> HashMap<SpaCheck, CheckOutcome> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_browser_returns_empty() {
        let outcomes = NoBrowser
            .run_checks(SpaCheckRequest {
                url: "https://example.com/app#/view?id=1".into(),
                param: "id".into(),
                payload: "<svg/onload=1>".into(),
                checks: vec![SpaCheck::DomXss],
            })
            .await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_check_wire_names() {
        assert_eq!(
            serde_json::to_string(&SpaCheck::PostMessageLeak).unwrap(),
            "\"post-message-leak\""
        );
    }
}
