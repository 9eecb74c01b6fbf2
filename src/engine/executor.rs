//! Task execution
//!
//! The executor runs exactly one task: replay the mutated request (or skip
//! straight to validation for passive tasks, or hand off to the browser
//! collaborator for SPA tasks), evaluate the validation rule, and confirm
//! via follow-up tracking probes where the recipe asks for them. Every
//! failure mode resolves to an unsuccessful result; a task can log a
//! problem but never abort the scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::browser::BrowserChecks;
use crate::error::BrowserError;
use crate::http::{RequestSchema, ResponseSchema, Transport, TransportCoordinator};
use crate::rulepack::expr::{EvalContext, OperatorRegistry};
use crate::rulepack::{AttackDefinition, ModuleRuntime, TrackingSpec};

use super::plan::{exchange_snapshot, AttackResult, AttackTask, Baseline, TaskPayload};

/// Upper bound on follow-up tracking probes per attack
const MAX_TRACKING_PROBES: usize = 3;

/// Runs individual attack tasks against the target
pub struct TaskExecutor {
    transport: Arc<dyn Transport>,
    browser: Arc<dyn BrowserChecks>,
    registry: Arc<OperatorRegistry>,
    modules: Arc<HashMap<String, ModuleRuntime>>,
    coordinator: Arc<TransportCoordinator>,

    /// Hard ceiling on one in-browser check batch
    spa_timeout_ms: u64,
}

impl TaskExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        browser: Arc<dyn BrowserChecks>,
        registry: Arc<OperatorRegistry>,
        modules: Arc<HashMap<String, ModuleRuntime>>,
        coordinator: Arc<TransportCoordinator>,
        spa_timeout_ms: u64,
    ) -> Self {
        Self {
            transport,
            browser,
            registry,
            modules,
            coordinator,
            spa_timeout_ms,
        }
    }

    /// Execute one task against its plan baseline. Returns `None` when a
    /// late condition re-evaluation rules the attack out; the scheduler
    /// still counts the task as settled.
    pub async fn run(&self, task: &AttackTask, baseline: &Baseline) -> Option<AttackResult> {
        let module = self.modules.get(&task.module_id)?;
        let attack = module
            .definition()
            .attacks
            .iter()
            .find(|a| a.id == task.attack_id)?;

        // concurrent modules defer condition evaluation to this point,
        // where the plan history is final
        if task.module_async {
            if let Some(condition) = &attack.condition {
                let ctx = EvalContext {
                    original: exchange_snapshot(&baseline.request, &baseline.response),
                    attack: Value::Null,
                    module: module.context_value(),
                };
                match self.registry.eval_bool(condition, &ctx) {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        tracing::warn!(
                            module = %task.module_id,
                            attack = %task.attack_id,
                            error = %e,
                            "Condition evaluation failed at execution time"
                        );
                        return None;
                    }
                }
            }
        }

        let mut result = blank_result(task, &baseline.request);
        match &task.payload {
            TaskPayload::Active(mutated) => {
                result.url = mutated.schema.url.clone();
                result.method = mutated.schema.method.clone();
                result.param = mutated.mutations.first().map(|m| m.name.clone());
                result.mutations = mutated.mutations.clone();

                let response = self.transport.send(&mutated.schema).await;
                if response.is_transport_failure() {
                    tracing::debug!(
                        module = %task.module_id,
                        url = %mutated.schema.url,
                        reason = %response.status_text,
                        "Attack request failed"
                    );
                    result.response = Some(response);
                    result.request = Some(mutated.schema.clone());
                    return Some(result);
                }

                let ctx = EvalContext {
                    original: exchange_snapshot(&baseline.request, &baseline.response),
                    attack: exchange_snapshot(&mutated.schema, &response),
                    module: module.context_value(),
                };
                self.validate(attack, &ctx, &mut result);
                if let Some(tracking) = &attack.tracking {
                    self.confirm_tracking(tracking, &mut result).await;
                }
                result.request = Some(mutated.schema.clone());
                result.response = Some(response);
            }
            TaskPayload::Passive => {
                // passive rules judge the captured exchange itself
                let snapshot = exchange_snapshot(&baseline.request, &baseline.response);
                let ctx = EvalContext {
                    original: snapshot.clone(),
                    attack: snapshot,
                    module: module.context_value(),
                };
                self.validate(attack, &ctx, &mut result);
            }
            TaskPayload::Spa(check_request) => {
                result.url = check_request.url.clone();
                result.param = Some(check_request.param.clone());
                self.run_spa(check_request.clone(), &mut result).await;
            }
        }

        Some(result)
    }

    /// Evaluate the validation rule and optional proof expression
    fn validate(&self, attack: &AttackDefinition, ctx: &EvalContext, result: &mut AttackResult) {
        let Some(validation) = &attack.validation else {
            return;
        };
        match self.registry.eval_bool(&validation.rule, ctx) {
            Ok(true) => {
                result.success = true;
                result.signals.push("rule-validation".to_string());
            }
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(
                    attack = %attack.id,
                    error = %e,
                    "Validation rule failed to evaluate"
                );
                return;
            }
        }
        if let Some(proof_expr) = &validation.proof {
            match self.registry.eval(proof_expr, ctx) {
                Ok(Value::Null) => {}
                Ok(Value::String(s)) => result.proof = Some(s),
                Ok(other) => result.proof = Some(other.to_string()),
                Err(e) => {
                    tracing::debug!(attack = %attack.id, error = %e, "Proof extraction failed");
                }
            }
        }
    }

    /// Probe the tracking URLs for the planted marker. A hit confirms the
    /// attack regardless of what the immediate response said.
    async fn confirm_tracking(&self, tracking: &TrackingSpec, result: &mut AttackResult) {
        for url in tracking.urls.iter().take(MAX_TRACKING_PROBES) {
            let mut probe = RequestSchema::new("GET", url);
            // probes reuse the captured session headers so authenticated
            // content stays visible
            if let Some(headers) = self.coordinator.stored_headers(&probe.host()) {
                probe.headers = headers;
            }
            // tracking probes serialize through the coordinator so
            // concurrent workers never interleave follow-up traffic
            // against the same collaborator endpoint
            let response = self.coordinator.serialized(self.transport.send(&probe)).await;
            if response.is_transport_failure() {
                continue;
            }
            if marker_present(&response, &tracking.marker) {
                result.success = true;
                result.tracking_confirmed = true;
                result.signals.push("tracking-confirmed".to_string());
                if result.proof.is_none() {
                    result.proof = Some(tracking.marker.clone());
                }
                break;
            }
        }
        if let Some(token) = &tracking.token {
            result.oob_token = Some(token.clone());
        }
    }

    /// Run the in-browser checks under a hard timeout. A hung page resolves
    /// to no outcome rather than a stalled worker.
    async fn run_spa(&self, request: crate::browser::SpaCheckRequest, result: &mut AttackResult) {
        let outcomes = match tokio::time::timeout(
            Duration::from_millis(self.spa_timeout_ms),
            self.browser.run_checks(request),
        )
        .await
        {
            Ok(outcomes) => outcomes,
            Err(_) => {
                let err = BrowserError::Timeout(self.spa_timeout_ms);
                tracing::warn!(error = %err, "In-browser check batch abandoned");
                return;
            }
        };

        for (check, outcome) in outcomes {
            if outcome.vulnerable {
                result.success = true;
                result.execution_confirmed = true;
                result.signals.push(format!("spa:{}", check.name()));
                if result.proof.is_none() {
                    result.proof = outcome.evidence;
                }
            }
        }
    }
}

fn marker_present(response: &ResponseSchema, marker: &str) -> bool {
    if response.body_text().contains(marker) {
        return true;
    }
    response
        .header("location")
        .map(|l| l.contains(marker))
        .unwrap_or(false)
}

fn blank_result(task: &AttackTask, original: &RequestSchema) -> AttackResult {
    AttackResult {
        task_id: task.id.clone(),
        module_id: task.module_id.clone(),
        attack_id: task.attack_id.clone(),
        attack_key: task.attack_key.clone(),
        kind: task.kind,
        url: original.url.clone(),
        method: original.method.clone(),
        param: None,
        mutations: Vec::new(),
        request: None,
        response: None,
        success: false,
        proof: None,
        signals: Vec::new(),
        tracking_confirmed: false,
        execution_confirmed: false,
        oob_token: None,
        finding_id: None,
        recorded: false,
        order: Some(task.order),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_in_body() {
        let mut resp = ResponseSchema::default();
        resp.status = 200;
        resp.body = b"uploaded: vstrk-abc123 ok".to_vec();
        assert!(marker_present(&resp, "vstrk-abc123"));
        assert!(!marker_present(&resp, "vstrk-other"));
    }

    #[test]
    fn test_marker_in_location_header() {
        let mut resp = ResponseSchema::default();
        resp.status = 302;
        resp.headers
            .insert("Location".to_string(), "/files/vstrk-abc123.txt".to_string());
        assert!(marker_present(&resp, "vstrk-abc123"));
    }
}
