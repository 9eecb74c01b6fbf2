//! Attack plan construction
//!
//! A plan groups every task derived from one captured request. The builder
//! executes the original request unmodified to capture the baseline, then
//! expands the active module set into an ordered task list. A task can
//! never exist without a baseline to validate against.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::browser::SpaCheckRequest;
use crate::config::{DastScanPolicy, ScanSettings};
use crate::error::PlanError;
use crate::http::{self, RequestSchema, ResponseSchema, Transport, TransportCoordinator};
use crate::rulepack::expr::{EvalContext, OperatorRegistry};
use crate::rulepack::{AttackDefinition, ModuleRuntime};

use super::mutation::{MutatedRequest, MutationEngine, MutationRecord};

/// Task kind, routed by module kind and attack descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Active,
    Passive,
    Spa,
}

/// Task payload: what the executor sends or checks
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// Mutated request to replay
    Active(MutatedRequest),
    /// Validate against the already-captured baseline; no request sent
    Passive,
    /// In-browser check descriptor
    Spa(SpaCheckRequest),
}

/// The unit of scheduling. Created by the plan builder, consumed exactly
/// once by the scheduler, never reused.
#[derive(Debug, Clone)]
pub struct AttackTask {
    pub id: String,
    pub kind: TaskKind,
    pub module_id: String,
    pub attack_id: String,
    pub payload: TaskPayload,

    /// Location-level dedup key (query values deliberately ignored)
    pub url_fingerprint: String,

    /// Identity for "unique" success accounting
    pub attack_key: String,

    /// Position within the owning plan; the only ordering guarantee
    pub order: usize,

    /// Whether the owning module allows concurrent instances
    pub module_async: bool,

    /// Owning plan
    pub plan_id: String,
}

/// Result of one executed task, buffered on the plan until finalization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackResult {
    pub task_id: String,
    pub module_id: String,
    pub attack_id: String,
    pub attack_key: String,
    pub kind: TaskKind,
    pub url: String,
    pub method: String,
    pub param: Option<String>,
    pub mutations: Vec<MutationRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSchema>,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,

    /// Confidence signals recorded during validation
    pub signals: Vec<String>,

    /// Confirmed via follow-up tracking request
    pub tracking_confirmed: bool,

    /// Confirmed via in-page execution (SPA / out-of-band)
    pub execution_confirmed: bool,

    /// Action token for out-of-band execution confirmation
    #[serde(skip)]
    pub oob_token: Option<String>,

    /// Back-link written by the aggregator when a finding is recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<String>,

    /// Aggregator idempotence guard
    #[serde(skip)]
    pub recorded: bool,

    /// Order scratch field; stripped at plan finalization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<usize>,
}

/// Shared per-plan execution state
#[derive(Debug, Default)]
pub struct PlanContext {
    /// Set when the plan has been throttled at least once
    pub rate_limited: bool,

    /// Per-module last-executed history
    pub last_executed: HashMap<String, DateTime<Utc>>,

    /// Keys already surfaced to the UI, for notification dedup
    pub notified: HashSet<String>,
}

/// Baseline request/response captured before any mutation
#[derive(Debug, Clone)]
pub struct Baseline {
    pub request: RequestSchema,
    pub response: ResponseSchema,
}

/// All tasks derived from one captured request
#[derive(Debug)]
pub struct AttackPlan {
    pub id: String,
    pub original: Baseline,
    pub fingerprint: String,

    /// Task queue, drained as scheduled
    pub tasks: VecDeque<AttackTask>,

    /// Countdown of outstanding tasks; zero finalizes the plan
    pub pending: usize,

    /// Accumulated results, re-sorted by task order at finalization
    pub attacks: Vec<AttackResult>,

    /// Shared execution state
    pub context: PlanContext,
}

impl AttackPlan {
    /// Re-sort accumulated results into task-build order and strip the
    /// order scratch fields. Called exactly once, at finalization.
    pub fn sort_results(&mut self) {
        self.attacks
            .sort_by_key(|a| a.order.unwrap_or(usize::MAX));
        for attack in &mut self.attacks {
            attack.order = None;
        }
    }
}

/// Builds attack plans from raw captured requests
pub struct PlanBuilder {
    modules: Vec<ModuleRuntime>,
    mutation: MutationEngine,
    registry: Arc<OperatorRegistry>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<TransportCoordinator>,
    settings: ScanSettings,
}

impl PlanBuilder {
    pub fn new(
        modules: Vec<ModuleRuntime>,
        registry: Arc<OperatorRegistry>,
        transport: Arc<dyn Transport>,
        coordinator: Arc<TransportCoordinator>,
        settings: ScanSettings,
    ) -> Self {
        // passive-only policy filters the module set up front
        let modules = match settings.dast_scan_policy {
            DastScanPolicy::Passive => modules.into_iter().filter(|m| m.is_passive()).collect(),
            DastScanPolicy::Active => modules,
        };
        Self {
            modules,
            mutation: MutationEngine::new(),
            registry,
            transport,
            coordinator,
            settings,
        }
    }

    pub fn modules(&self) -> &[ModuleRuntime] {
        &self.modules
    }

    /// Build a plan for one raw captured request. Returns `None` when the
    /// request cannot be parsed or the baseline execution fails.
    pub async fn build_attack_plan(&self, raw: &[u8]) -> Option<AttackPlan> {
        let schema = match http::parse(raw).map_err(|e| PlanError::ParseError(e.to_string())) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping captured request");
                return None;
            }
        };
        self.build_plan_for_schema(schema).await
    }

    /// Build a plan for an already-parsed schema
    pub async fn build_plan_for_schema(&self, schema: RequestSchema) -> Option<AttackPlan> {
        match self.capture_baseline(schema).await {
            Ok(baseline) => Some(self.expand(baseline)),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping captured request");
                None
            }
        }
    }

    /// Execute the original request unmodified. A transport failure here
    /// aborts the whole plan; attacks without a baseline are meaningless.
    async fn capture_baseline(&self, schema: RequestSchema) -> Result<Baseline, PlanError> {
        let response = self.transport.send(&schema).await;
        if response.is_transport_failure() {
            return Err(PlanError::BaselineFailed {
                url: schema.url.clone(),
                reason: response.status_text.clone(),
            });
        }

        // remember the captured auth headers so follow-up probes against
        // this host stay authenticated
        let mut session_headers = schema.headers.clone();
        if !schema.cookies.is_empty() {
            session_headers.push(("Cookie".to_string(), schema.cookie_header()));
        }
        self.coordinator.store_headers(&schema.host(), session_headers);

        Ok(Baseline {
            request: schema,
            response,
        })
    }

    fn expand(&self, baseline: Baseline) -> AttackPlan {
        let plan_id = Uuid::new_v4().to_string();
        let fingerprint = http::request_fingerprint(&baseline.request);
        let baseline_ctx = EvalContext {
            original: exchange_snapshot(&baseline.request, &baseline.response),
            attack: serde_json::Value::Null,
            module: serde_json::Value::Null,
        };

        let mut tasks = VecDeque::new();
        for module in &self.modules {
            let def = module.definition();
            for attack in &def.attacks {
                // pre-filter conditions only for non-concurrent modules;
                // concurrent modules re-evaluate at execution time since
                // their last-executed history may be stale here
                if !def.is_async {
                    if let Some(condition) = &attack.condition {
                        let mut ctx = baseline_ctx.clone();
                        ctx.module = module.context_value();
                        match self.registry.eval_bool(condition, &ctx) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                tracing::warn!(
                                    module = %def.id,
                                    attack = %attack.id,
                                    error = %e,
                                    "Condition evaluation failed, skipping attack"
                                );
                                continue;
                            }
                        }
                    }
                }

                if attack.spa.is_some() {
                    self.build_spa_tasks(module, attack, &baseline, &plan_id, &mut tasks);
                } else if module.is_passive() {
                    self.build_passive_task(module, attack, &baseline, &plan_id, &mut tasks);
                } else {
                    self.build_active_tasks(module, attack, &baseline, &plan_id, &mut tasks);
                }
            }
        }

        // assign the plan-relative order now that routing is complete
        for (order, task) in tasks.iter_mut().enumerate() {
            task.order = order;
        }

        let pending = tasks.len();
        AttackPlan {
            id: plan_id,
            original: baseline,
            fingerprint,
            tasks,
            pending,
            attacks: Vec::new(),
            context: PlanContext::default(),
        }
    }

    fn build_active_tasks(
        &self,
        module: &ModuleRuntime,
        attack: &AttackDefinition,
        baseline: &Baseline,
        plan_id: &str,
        tasks: &mut VecDeque<AttackTask>,
    ) {
        let Some(action) = &attack.action else {
            return;
        };
        let def = module.definition();
        let mode = self.mutation.resolve_mode(
            None,
            def.metadata.supports_atomic,
            self.settings.scan_strategy.atomic_mutations(),
        );
        for mutated in self.mutation.build_attacks(&baseline.request, action, mode) {
            let url_fingerprint = http::request_fingerprint(&mutated.schema);
            tasks.push_back(AttackTask {
                id: Uuid::new_v4().to_string(),
                kind: TaskKind::Active,
                module_id: def.id.clone(),
                attack_id: attack.id.clone(),
                attack_key: attack_key(&def.id, &attack.id),
                url_fingerprint,
                payload: TaskPayload::Active(mutated),
                order: 0,
                module_async: def.is_async,
                plan_id: plan_id.to_string(),
            });
        }
    }

    fn build_passive_task(
        &self,
        module: &ModuleRuntime,
        attack: &AttackDefinition,
        baseline: &Baseline,
        plan_id: &str,
        tasks: &mut VecDeque<AttackTask>,
    ) {
        let def = module.definition();
        tasks.push_back(AttackTask {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Passive,
            module_id: def.id.clone(),
            attack_id: attack.id.clone(),
            attack_key: attack_key(&def.id, &attack.id),
            url_fingerprint: http::request_fingerprint(&baseline.request),
            payload: TaskPayload::Passive,
            order: 0,
            module_async: def.is_async,
            plan_id: plan_id.to_string(),
        });
    }

    /// SPA routing: one task per (hash-fragment query param x payload),
    /// only when the URL encodes parameters after a hash fragment.
    fn build_spa_tasks(
        &self,
        module: &ModuleRuntime,
        attack: &AttackDefinition,
        baseline: &Baseline,
        plan_id: &str,
        tasks: &mut VecDeque<AttackTask>,
    ) {
        let Some(spa) = &attack.spa else {
            return;
        };
        let def = module.definition();
        let params = fragment_params(&baseline.request.url);
        for (param, value) in &params {
            for payload in &spa.payloads {
                let url =
                    substitute_fragment_param(&baseline.request.url, param, value, payload);
                tasks.push_back(AttackTask {
                    id: Uuid::new_v4().to_string(),
                    kind: TaskKind::Spa,
                    module_id: def.id.clone(),
                    attack_id: attack.id.clone(),
                    attack_key: attack_key(&def.id, &attack.id),
                    url_fingerprint: format!("spa {} {}", baseline.request.url, param),
                    payload: TaskPayload::Spa(SpaCheckRequest {
                        url,
                        param: param.clone(),
                        payload: payload.clone(),
                        checks: spa.checks.clone(),
                    }),
                    order: 0,
                    module_async: def.is_async,
                    plan_id: plan_id.to_string(),
                });
            }
        }
    }
}

fn attack_key(module_id: &str, attack_id: &str) -> String {
    format!("{}:{}", module_id, attack_id)
}

/// Snapshot a request/response pair into the expression context shape
pub fn exchange_snapshot(request: &RequestSchema, response: &ResponseSchema) -> serde_json::Value {
    serde_json::json!({
        "request": {
            "url": request.url,
            "method": request.method,
            "body": request.body_text(),
        },
        "response": {
            "status": response.status,
            "statusText": response.status_text,
            "headers": response.headers,
            "body": response.body_text(),
            "durationMs": response.duration_ms,
        },
    })
}

/// Extract query parameters encoded after a hash fragment
/// (single-page-app routing pattern, e.g. `/app#/view?id=1`)
pub fn fragment_params(url: &str) -> Vec<(String, String)> {
    let Some((_, fragment)) = url.split_once('#') else {
        return Vec::new();
    };
    let Some((_, query)) = fragment.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn substitute_fragment_param(url: &str, param: &str, value: &str, payload: &str) -> String {
    let needle = format!("{}={}", param, value);
    let replacement = format!("{}={}", param, payload);
    url.replacen(&needle, &replacement, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_params_extraction() {
        let params = fragment_params("https://example.com/app#/view?id=1&tab=main");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("id".to_string(), "1".to_string()));
    }

    #[test]
    fn test_no_fragment_query_means_no_params() {
        assert!(fragment_params("https://example.com/app?id=1").is_empty());
        assert!(fragment_params("https://example.com/app#/view").is_empty());
    }

    #[test]
    fn test_substitute_fragment_param() {
        let url = substitute_fragment_param(
            "https://example.com/app#/view?id=1&tab=main",
            "id",
            "1",
            "<payload>",
        );
        assert_eq!(url, "https://example.com/app#/view?id=<payload>&tab=main");
    }

    #[test]
    fn test_sort_results_strips_order() {
        let mut plan = AttackPlan {
            id: "p".into(),
            original: Baseline {
                request: RequestSchema::new("GET", "https://example.com/"),
                response: ResponseSchema::default(),
            },
            fingerprint: String::new(),
            tasks: VecDeque::new(),
            pending: 0,
            attacks: vec![
                result_with_order(2),
                result_with_order(0),
                result_with_order(1),
            ],
            context: PlanContext::default(),
        };
        plan.sort_results();
        assert!(plan.attacks.iter().all(|a| a.order.is_none()));
        assert_eq!(plan.attacks[0].task_id, "t0");
        assert_eq!(plan.attacks[2].task_id, "t2");
    }

    fn result_with_order(order: usize) -> AttackResult {
        AttackResult {
            task_id: format!("t{}", order),
            module_id: "m".into(),
            attack_id: "a".into(),
            attack_key: "m:a".into(),
            kind: TaskKind::Active,
            url: String::new(),
            method: "GET".into(),
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
            order: Some(order),
        }
    }
}
