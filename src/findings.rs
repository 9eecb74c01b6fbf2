//! Unified finding model
//!
//! A `Finding` is the externally visible result of one successful attack,
//! normalized into the cross-engine shape. Findings are immutable after
//! creation; the aggregator writes a `finding_id` back-link onto the
//! originating attack result instead of touching the finding again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity level for findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

/// Where the vulnerability was observed
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FindingLocation {
    /// URL of the attacked request
    pub url: String,

    /// HTTP method
    pub method: String,

    /// Affected parameter (if the attack targeted one)
    pub param: Option<String>,
}

/// DAST evidence attached to a finding
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DastEvidence {
    /// Raw attack request
    pub request: String,

    /// Attack response snapshot (status + body excerpt)
    pub response: String,

    /// Proof snippet extracted by the validation rule
    pub proof: Option<String>,

    /// Baseline request URL the attack was derived from
    pub original_url: String,

    /// Confidence signals recorded during validation, for auditability
    pub signals: Vec<String>,
}

/// A recorded successful attack, normalized into the unified shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Deterministic ID derived from scan + module + rule + index
    pub id: String,

    /// Producing engine; always "DAST" for this crate
    pub engine: String,

    /// Severity level
    pub severity: Severity,

    /// Confidence score, clamped to 0-100
    pub confidence: u8,

    /// Vulnerability category
    pub category: String,

    /// Stable vulnerability identifier
    pub vuln_id: String,

    /// Module that produced the finding
    pub module_id: String,

    /// Attack rule within the module
    pub rule_id: String,

    /// OWASP category tag
    pub owasp: Option<String>,

    /// CWE identifier
    pub cwe: Option<u32>,

    /// Free-form tags
    pub tags: Vec<String>,

    /// Location of the vulnerability
    pub location: FindingLocation,

    /// DAST evidence
    pub evidence: DastEvidence,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    /// Deterministic finding ID
    pub fn make_id(scan_id: &str, module_id: &str, rule_id: &str, index: usize) -> String {
        format!("{}:{}:{}:{}", scan_id, module_id, rule_id, index)
    }
}

/// Key identifying a finding group bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FindingGroupKey {
    pub engine: String,
    pub vuln_id: String,
    pub module_id: String,
    pub rule_id: String,
    pub url: String,
    pub param: Option<String>,
}

/// A dedup bucket aggregating repeated occurrences of the same finding
/// identity. Created lazily on first sight, never deleted during a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingGroup {
    /// Group identity key
    pub key: FindingGroupKey,

    /// IDs of findings in this group
    pub occurrence_ids: Vec<String>,

    /// Occurrence count
    pub count: usize,
}

impl FindingGroup {
    pub fn new(key: FindingGroupKey, first_finding_id: &str) -> Self {
        Self {
            key,
            occurrence_ids: vec![first_finding_id.to_string()],
            count: 1,
        }
    }

    pub fn record(&mut self, finding_id: &str) {
        self.occurrence_ids.push(finding_id.to_string());
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("HIGH"), Severity::High);
        assert_eq!(Severity::parse("bogus"), Severity::Info);
    }

    #[test]
    fn test_deterministic_finding_id() {
        let a = Finding::make_id("scan1", "sqli", "error-based", 0);
        let b = Finding::make_id("scan1", "sqli", "error-based", 0);
        assert_eq!(a, b);
        assert_ne!(a, Finding::make_id("scan1", "sqli", "error-based", 1));
    }

    #[test]
    fn test_group_counting() {
        let key = FindingGroupKey {
            engine: "DAST".into(),
            vuln_id: "sqli".into(),
            module_id: "sqli".into(),
            rule_id: "error-based".into(),
            url: "https://example.com/".into(),
            param: Some("q".into()),
        };
        let mut group = FindingGroup::new(key, "f1");
        group.record("f2");
        assert_eq!(group.count, 2);
        assert_eq!(group.occurrence_ids, vec!["f1", "f2"]);
    }
}
