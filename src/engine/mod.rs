//! Scan engine
//!
//! Ties the pipeline together: plan construction, scheduling, execution,
//! and finding aggregation, behind a small lifecycle API. One engine
//! instance corresponds to one scan envelope.

pub mod aggregate;
pub mod executor;
pub mod mutation;
pub mod plan;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::browser::BrowserChecks;
use crate::config::ScanSettings;
use crate::http::{RequestSchema, ResponseSchema, Transport, TransportCoordinator};
use crate::report::{ScanEnvelope, StrategyStats};
use crate::rulepack::expr::OperatorRegistry;
use crate::rulepack::{ModuleDefinition, ModuleRuntime};

use aggregate::FindingAggregator;
use executor::TaskExecutor;
use plan::PlanBuilder;
pub use mutation::{MutatedRequest, MutationEngine, MutationMode, MutationRecord};
pub use plan::{AttackPlan, AttackResult, AttackTask, Baseline, TaskKind, TaskPayload};
pub use scheduler::TaskScheduler;

/// Hard ceiling on one in-browser check batch
const SPA_CHECK_TIMEOUT_MS: u64 = 10_000;

/// Result of a one-time scan of a single request, outside the scheduler
#[derive(Debug)]
pub struct OneTimeScan {
    pub request: RequestSchema,
    pub response: ResponseSchema,
    pub attacks: Vec<AttackResult>,
    pub stats: StrategyStats,
}

/// One scan run over one target host
pub struct ScanEngine {
    scheduler: Arc<TaskScheduler>,
    envelope: Arc<RwLock<ScanEnvelope>>,
    settings: ScanSettings,
    host: String,

    // one-time scans run on their own pipeline instances so they never
    // contend with scheduled work
    onetime_builder: PlanBuilder,
    onetime_executor: TaskExecutor,
    onetime_aggregator: FindingAggregator,
}

impl ScanEngine {
    pub fn new(
        host: &str,
        domain_allowlist: Vec<String>,
        modules: Vec<ModuleDefinition>,
        settings: ScanSettings,
        transport: Arc<dyn Transport>,
        browser: Arc<dyn BrowserChecks>,
    ) -> Self {
        let settings = settings.normalized();
        let scan_id = Uuid::new_v4().to_string();

        let runtimes: Vec<ModuleRuntime> = modules.into_iter().map(ModuleRuntime::new).collect();
        let module_map: Arc<HashMap<String, ModuleRuntime>> = Arc::new(
            runtimes
                .iter()
                .map(|m| (m.id().to_string(), m.clone()))
                .collect(),
        );
        let registry = Arc::new(OperatorRegistry::with_builtins());
        let coordinator = Arc::new(TransportCoordinator::default());
        let envelope = Arc::new(RwLock::new(ScanEnvelope::new(
            &scan_id,
            host,
            settings.clone(),
        )));

        let builder = PlanBuilder::new(
            runtimes.clone(),
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&coordinator),
            settings.clone(),
        );
        let executor = TaskExecutor::new(
            Arc::clone(&transport),
            Arc::clone(&browser),
            Arc::clone(&registry),
            Arc::clone(&module_map),
            Arc::clone(&coordinator),
            SPA_CHECK_TIMEOUT_MS,
        );
        let aggregator = FindingAggregator::new(Arc::clone(&module_map), Arc::clone(&envelope));
        let scheduler = Arc::new(TaskScheduler::new(
            builder,
            executor,
            aggregator,
            Arc::clone(&envelope),
            Arc::clone(&module_map),
            settings.clone(),
            domain_allowlist,
        ));

        let onetime_builder = PlanBuilder::new(
            runtimes,
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&coordinator),
            settings.clone(),
        );
        let onetime_executor = TaskExecutor::new(
            transport,
            browser,
            registry,
            Arc::clone(&module_map),
            coordinator,
            SPA_CHECK_TIMEOUT_MS,
        );
        let onetime_aggregator = FindingAggregator::new(module_map, Arc::clone(&envelope));

        Self {
            scheduler,
            envelope,
            settings,
            host: host.to_string(),
            onetime_builder,
            onetime_executor,
            onetime_aggregator,
        }
    }

    /// Spawn the worker loops and begin accepting captured requests
    pub fn start(&self) {
        tracing::info!(
            host = %self.host,
            strategy = %self.settings.scan_strategy.as_str(),
            concurrency = self.settings.concurrency,
            rps = self.settings.max_requests_per_second,
            "Scan started"
        );
        Arc::clone(&self.scheduler).start();
    }

    /// Halt the scan, finalize outstanding plans, and seal the envelope
    pub fn stop(&self) {
        self.scheduler.stop();
        tracing::info!(host = %self.host, "Scan stopped");
    }

    /// Admit one raw captured request into the scan
    pub fn enqueue_request(&self, raw: &[u8]) -> bool {
        self.scheduler.enqueue_request(raw)
    }

    /// Out-of-band execution confirmation by action token
    pub fn confirm_execution(&self, token: &str) {
        self.scheduler.confirm_execution(token);
    }

    /// Wait until all queued and in-flight work has drained
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_idle(timeout).await
    }

    /// Scan a single raw request synchronously, bypassing the scheduler.
    /// Findings still land in the shared envelope.
    pub async fn onetime_scan_request(&self, raw: &[u8]) -> Option<OneTimeScan> {
        let mut plan = self.onetime_builder.build_attack_plan(raw).await?;
        let baseline = plan.original.clone();
        let mut stats = StrategyStats {
            planned: plan.tasks.len(),
            ..Default::default()
        };
        let mut attacks = Vec::new();
        for task in plan.tasks.drain(..) {
            if let Some(mut result) = self.onetime_executor.run(&task, &baseline).await {
                stats.executed += 1;
                self.onetime_aggregator
                    .record_if_successful(&mut result, &baseline.request.url);
                result.order = None;
                attacks.push(result);
            }
        }
        Some(OneTimeScan {
            request: baseline.request,
            response: baseline.response,
            attacks,
            stats,
        })
    }

    /// Snapshot of the scan envelope
    pub fn envelope(&self) -> ScanEnvelope {
        self.envelope.read().clone()
    }

    /// Shared handle to the live envelope
    pub fn envelope_handle(&self) -> Arc<RwLock<ScanEnvelope>> {
        Arc::clone(&self.envelope)
    }

    /// Clear all scan state and start a fresh envelope under the same
    /// settings. The engine stays stopped until `start` is called again.
    pub fn reset(&self) {
        self.scheduler.reset();
        let scan_id = Uuid::new_v4().to_string();
        *self.envelope.write() = ScanEnvelope::new(&scan_id, &self.host, self.settings.clone());
        tracing::info!(host = %self.host, "Engine reset");
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }
}
