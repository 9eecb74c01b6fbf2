//! Scan result envelope
//!
//! The envelope is the only durable artifact of a run. Its JSON shape is the
//! wire contract toward storage and export and must stay stable across
//! versions for backward-compatible consumption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScanSettings;
use crate::engine::plan::AttackResult;
use crate::findings::{Finding, FindingGroup, Severity};

/// Envelope wire format version
pub const ENVELOPE_VERSION: u32 = 1;

/// Running per-severity and totals counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
    pub attacks_count: usize,
    pub findings_count: usize,
}

impl ScanStats {
    pub fn bump_severity(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }
}

/// Strategy-level execution counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    /// Tasks built into plans
    pub planned: usize,

    /// Tasks actually executed
    pub executed: usize,

    /// Tasks short-circuited by stop-on-first-finding
    pub skipped_due_to_strategy: usize,
}

/// Per-original-request attack attachment record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Plan ID this record belongs to
    pub plan_id: String,

    /// Baseline request URL
    pub url: String,

    /// Baseline request method
    pub method: String,

    /// Dedup fingerprint of the original request
    pub fingerprint: String,

    /// Number of attacks executed against this request
    pub attacks_count: usize,

    /// IDs of findings produced from this request
    pub finding_ids: Vec<String>,

    /// Executed attack results, in plan build order
    pub attacks: Vec<AttackResult>,
}

/// Top-level run record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEnvelope {
    /// Wire format version
    pub version: u32,

    /// Producing engine
    pub engine: String,

    /// Scan run identifier
    pub scan_id: String,

    /// Target host
    pub host: String,

    /// Scan start time
    pub started_at: DateTime<Utc>,

    /// Scan end time; set when the envelope is sealed
    pub finished_at: Option<DateTime<Utc>>,

    /// Active scan-strategy settings
    pub settings: ScanSettings,

    /// Running counters
    pub stats: ScanStats,

    /// Recorded findings
    pub findings: Vec<Finding>,

    /// Finding dedup groups
    pub groups: Vec<FindingGroup>,

    /// Per-original-request records
    pub requests: Vec<RequestRecord>,

    /// Strategy-level counters
    pub scan_stats: StrategyStats,
}

impl ScanEnvelope {
    /// Create a fresh envelope at scan start
    pub fn new(scan_id: &str, host: &str, settings: ScanSettings) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            engine: "DAST".to_string(),
            scan_id: scan_id.to_string(),
            host: host.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            settings,
            stats: ScanStats::default(),
            findings: Vec::new(),
            groups: Vec::new(),
            requests: Vec::new(),
            scan_stats: StrategyStats::default(),
        }
    }

    /// Seal the envelope at scan stop
    pub fn seal(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = ScanEnvelope::new("scan1", "example.com", ScanSettings::default());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["engine"], "DAST");
        assert!(json["scanStats"]["skippedDueToStrategy"].is_number());
        assert!(json["stats"]["findingsCount"].is_number());
        assert!(json["findings"].is_array());
        assert!(json["groups"].is_array());
    }

    #[test]
    fn test_attack_record_wire_shape() {
        use crate::engine::plan::TaskKind;

        let attack = AttackResult {
            task_id: "t1".into(),
            module_id: "sqli".into(),
            attack_id: "a1".into(),
            attack_key: "sqli:a1".into(),
            kind: TaskKind::Active,
            url: "https://example.com/?q=1".into(),
            method: "GET".into(),
            param: Some("q".into()),
            mutations: Vec::new(),
            request: None,
            response: None,
            success: true,
            proof: None,
            signals: vec!["rule-validation".into()],
            tracking_confirmed: false,
            execution_confirmed: false,
            oob_token: None,
            finding_id: None,
            recorded: false,
            order: None,
        };
        let record = RequestRecord {
            plan_id: "p1".into(),
            url: "https://example.com/?q=1".into(),
            method: "GET".into(),
            fingerprint: "fp".into(),
            attacks_count: 1,
            finding_ids: Vec::new(),
            attacks: vec![attack],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["planId"].is_string());
        let attack = &json["attacks"][0];
        assert_eq!(attack["taskId"], "t1");
        assert_eq!(attack["moduleId"], "sqli");
        assert_eq!(attack["attackKey"], "sqli:a1");
        assert!(attack["trackingConfirmed"].is_boolean());
        assert!(attack["executionConfirmed"].is_boolean());
        assert!(attack.get("task_id").is_none());
        assert!(attack.get("oobToken").is_none());
    }

    #[test]
    fn test_seal_is_idempotent() {
        let mut envelope = ScanEnvelope::new("scan1", "example.com", ScanSettings::default());
        envelope.seal();
        let first = envelope.finished_at;
        envelope.seal();
        assert_eq!(envelope.finished_at, first);
    }
}
