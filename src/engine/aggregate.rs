//! Finding aggregation
//!
//! Successful attack results are normalized into findings, counted into the
//! envelope stats, and folded into dedup groups. Recording is idempotent
//! per attack result: re-finalization of a plan never double-counts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::findings::{
    DastEvidence, Finding, FindingGroup, FindingGroupKey, FindingLocation, Severity,
};
use crate::http;
use crate::report::ScanEnvelope;
use crate::rulepack::ModuleRuntime;

use super::plan::AttackResult;

/// Body excerpt cap for evidence snapshots
const EVIDENCE_BODY_LIMIT: usize = 2048;

/// Folds successful attack results into the scan envelope
pub struct FindingAggregator {
    modules: Arc<HashMap<String, ModuleRuntime>>,
    envelope: Arc<RwLock<ScanEnvelope>>,
}

impl FindingAggregator {
    pub fn new(
        modules: Arc<HashMap<String, ModuleRuntime>>,
        envelope: Arc<RwLock<ScanEnvelope>>,
    ) -> Self {
        Self { modules, envelope }
    }

    /// Record a finding for a successful result. Returns the finding ID, or
    /// `None` when the result was unsuccessful or already recorded.
    pub fn record_if_successful(
        &self,
        result: &mut AttackResult,
        original_url: &str,
    ) -> Option<String> {
        if !result.success || result.recorded {
            return None;
        }
        let module = self.modules.get(&result.module_id)?;
        let def = module.definition();
        let attack = def.attacks.iter().find(|a| a.id == result.attack_id);

        let severity = attack
            .and_then(|a| a.severity)
            .or_else(|| attack.and_then(|a| a.validation.as_ref()).and_then(|v| v.severity))
            .or(def.metadata.severity)
            .unwrap_or_else(|| default_severity(&def.metadata.category));

        let confidence = self.confidence_for(result, attack, def.metadata.confidence);

        let mut envelope = self.envelope.write();
        let finding_id = Finding::make_id(
            &envelope.scan_id,
            &result.module_id,
            &result.attack_id,
            envelope.findings.len(),
        );

        let finding = Finding {
            id: finding_id.clone(),
            engine: envelope.engine.clone(),
            severity,
            confidence,
            category: def.metadata.category.clone(),
            vuln_id: def.id.clone(),
            module_id: result.module_id.clone(),
            rule_id: result.attack_id.clone(),
            owasp: def.metadata.owasp.clone(),
            cwe: def.metadata.cwe,
            tags: def.metadata.tags.clone(),
            location: FindingLocation {
                url: result.url.clone(),
                method: result.method.clone(),
                param: result.param.clone(),
            },
            evidence: DastEvidence {
                request: result
                    .request
                    .as_ref()
                    .map(|r| String::from_utf8_lossy(&http::build(r)).to_string())
                    .unwrap_or_default(),
                response: result
                    .response
                    .as_ref()
                    .map(|r| {
                        let body = r.body_text();
                        let excerpt: String = body.chars().take(EVIDENCE_BODY_LIMIT).collect();
                        format!("{} {}\n{}", r.status, r.status_text, excerpt)
                    })
                    .unwrap_or_default(),
                proof: result.proof.clone(),
                original_url: original_url.to_string(),
                signals: result.signals.clone(),
            },
            timestamp: Utc::now(),
        };

        envelope.stats.bump_severity(severity);
        envelope.stats.findings_count += 1;

        let key = FindingGroupKey {
            engine: envelope.engine.clone(),
            vuln_id: finding.vuln_id.clone(),
            module_id: finding.module_id.clone(),
            rule_id: finding.rule_id.clone(),
            url: finding.location.url.clone(),
            param: finding.location.param.clone(),
        };
        match envelope.groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.record(&finding_id),
            None => envelope.groups.push(FindingGroup::new(key, &finding_id)),
        }

        envelope.findings.push(finding);
        drop(envelope);

        result.finding_id = Some(finding_id.clone());
        result.recorded = true;
        Some(finding_id)
    }

    fn confidence_for(
        &self,
        result: &AttackResult,
        attack: Option<&crate::rulepack::AttackDefinition>,
        module_confidence: Option<u8>,
    ) -> u8 {
        if result.tracking_confirmed || result.execution_confirmed {
            return 95;
        }
        let explicit = attack
            .and_then(|a| a.confidence)
            .or_else(|| attack.and_then(|a| a.validation.as_ref()).and_then(|v| v.confidence))
            .or(module_confidence);
        if let Some(c) = explicit {
            return c.min(100);
        }
        if result.signals.iter().any(|s| s == "rule-validation") {
            return 80;
        }
        30
    }
}

/// Fallback severity when neither the attack, rule, nor module set one
fn default_severity(category: &str) -> Severity {
    match category {
        "injection" | "rce" | "auth" => Severity::High,
        "disclosure" | "info-disclosure" | "misconfiguration" => Severity::Low,
        _ => Severity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanSettings;
    use crate::engine::plan::TaskKind;
    use crate::rulepack::{load_modules, ModuleRuntime};

    fn setup() -> (FindingAggregator, Arc<RwLock<ScanEnvelope>>) {
        let modules = load_modules(
            r#"[{
                "id": "sqli",
                "kind": "active",
                "metadata": {"severity": "high", "category": "injection", "cwe": 89},
                "attacks": [{
                    "id": "error-based",
                    "validation": {"rule": true}
                }]
            }]"#
            .as_bytes(),
        )
        .unwrap();
        let map: HashMap<String, ModuleRuntime> = modules
            .into_iter()
            .map(|m| (m.id.clone(), ModuleRuntime::new(m)))
            .collect();
        let envelope = Arc::new(RwLock::new(ScanEnvelope::new(
            "scan1",
            "example.com",
            ScanSettings::default(),
        )));
        (
            FindingAggregator::new(Arc::new(map), envelope.clone()),
            envelope,
        )
    }

    fn successful_result() -> AttackResult {
        AttackResult {
            task_id: "t1".into(),
            module_id: "sqli".into(),
            attack_id: "error-based".into(),
            attack_key: "sqli:error-based".into(),
            kind: TaskKind::Active,
            url: "https://example.com/search?q=x".into(),
            method: "GET".into(),
            param: Some("q".into()),
            mutations: Vec::new(),
            request: None,
            response: None,
            success: true,
            proof: Some("SQL syntax error".into()),
            signals: vec!["rule-validation".into()],
            tracking_confirmed: false,
            execution_confirmed: false,
            oob_token: None,
            finding_id: None,
            recorded: false,
            order: None,
        }
    }

    #[test]
    fn test_recording_is_idempotent() {
        let (aggregator, envelope) = setup();
        let mut result = successful_result();
        let first = aggregator.record_if_successful(&mut result, "https://example.com/search");
        assert!(first.is_some());
        let second = aggregator.record_if_successful(&mut result, "https://example.com/search");
        assert!(second.is_none());
        assert_eq!(envelope.read().findings.len(), 1);
        assert_eq!(envelope.read().stats.findings_count, 1);
        assert_eq!(result.finding_id, first);
    }

    #[test]
    fn test_unsuccessful_result_not_recorded() {
        let (aggregator, envelope) = setup();
        let mut result = successful_result();
        result.success = false;
        assert!(aggregator
            .record_if_successful(&mut result, "https://example.com/")
            .is_none());
        assert!(envelope.read().findings.is_empty());
    }

    #[test]
    fn test_severity_and_confidence_resolution() {
        let (aggregator, envelope) = setup();
        let mut result = successful_result();
        aggregator.record_if_successful(&mut result, "https://example.com/");
        let envelope = envelope.read();
        let finding = &envelope.findings[0];
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.confidence, 80);
        assert_eq!(finding.cwe, Some(89));
    }

    #[test]
    fn test_confirmed_result_gets_high_confidence() {
        let (aggregator, envelope) = setup();
        let mut result = successful_result();
        result.tracking_confirmed = true;
        aggregator.record_if_successful(&mut result, "https://example.com/");
        assert_eq!(envelope.read().findings[0].confidence, 95);
    }

    #[test]
    fn test_groups_fold_repeat_occurrences() {
        let (aggregator, envelope) = setup();
        let mut first = successful_result();
        let mut second = successful_result();
        second.task_id = "t2".into();
        aggregator.record_if_successful(&mut first, "https://example.com/");
        aggregator.record_if_successful(&mut second, "https://example.com/");
        let envelope = envelope.read();
        assert_eq!(envelope.findings.len(), 2);
        assert_eq!(envelope.groups.len(), 1);
        assert_eq!(envelope.groups[0].count, 2);
    }
}
