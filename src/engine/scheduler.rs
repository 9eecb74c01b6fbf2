//! Task scheduling
//!
//! One scheduler owns the whole execution pipeline: a deduplicated queue of
//! captured requests, a flat queue of attack tasks, and a set of worker
//! loops sized to the configured concurrency. Workers prefer tasks over
//! plan-building so attack traffic drains before new plans fan out.
//!
//! All queue state lives behind a single mutex; a worker's dequeue,
//! lock acquisition, and strategy skips happen atomically under it. The
//! mutex is never held across an await point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::{sleep, Instant};

use crate::config::{DedupScope, ScanSettings};
use crate::http::{self, RequestSchema};
use crate::report::{RequestRecord, ScanEnvelope};
use crate::rulepack::ModuleRuntime;

use super::aggregate::FindingAggregator;
use super::executor::TaskExecutor;
use super::plan::{AttackPlan, AttackResult, AttackTask, PlanBuilder, TaskKind, TaskPayload};

/// Worker poll interval when both queues are empty
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Poll interval while waiting on a rate-limit token
const RATE_POLL: Duration = Duration::from_millis(20);

/// Rolling refill window of the token bucket
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Token bucket refilled to capacity once per rolling window
struct TokenBucket {
    capacity: u32,
    tokens: u32,
    window_start: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window_start: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        if self.window_start.elapsed() >= RATE_WINDOW {
            self.tokens = self.capacity;
            self.window_start = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    /// Fingerprints already admitted, for enqueue-time dedup
    seen_fingerprints: HashSet<String>,

    /// Captured requests awaiting plan construction
    request_queue: VecDeque<RequestSchema>,

    /// Tasks awaiting execution, across all plans
    task_queue: VecDeque<AttackTask>,

    /// Plans with outstanding tasks, by plan ID
    active_plans: HashMap<String, AttackPlan>,

    /// Non-concurrent modules currently executing
    module_locks: HashSet<String>,

    /// Plans with a task in flight; one task per plan at a time
    plan_locks: HashSet<String>,

    /// Unique-limited attack keys that already produced a finding
    suppressed: HashSet<String>,

    /// Stop-on-first-finding skip keys, scoped per strategy
    stop_keys: HashSet<String>,
}

enum Work {
    Build(RequestSchema),
    Run(AttackTask),
}

/// Drives plan construction and task execution across worker loops
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    builder: PlanBuilder,
    executor: TaskExecutor,
    aggregator: FindingAggregator,
    envelope: Arc<RwLock<ScanEnvelope>>,
    modules: Arc<HashMap<String, ModuleRuntime>>,
    settings: ScanSettings,
    allowlist: Vec<String>,
    bucket: Mutex<TokenBucket>,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
}

impl TaskScheduler {
    pub fn new(
        builder: PlanBuilder,
        executor: TaskExecutor,
        aggregator: FindingAggregator,
        envelope: Arc<RwLock<ScanEnvelope>>,
        modules: Arc<HashMap<String, ModuleRuntime>>,
        settings: ScanSettings,
        allowlist: Vec<String>,
    ) -> Self {
        let bucket = Mutex::new(TokenBucket::new(settings.max_requests_per_second));
        Self {
            state: Mutex::new(SchedulerState::default()),
            builder,
            executor,
            aggregator,
            envelope,
            modules,
            settings,
            allowlist,
            bucket,
            stopped: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Spawn the worker loops. Idempotent only across stop/start cycles;
    /// callers must not start a running scheduler twice.
    pub fn start(self: Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        for worker_id in 0..self.settings.concurrency {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move { scheduler.worker_loop(worker_id).await });
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Admit one raw captured request. Returns false when the request is a
    /// duplicate of an already-admitted fingerprint or cannot be parsed.
    pub fn enqueue_request(&self, raw: &[u8]) -> bool {
        if self.is_stopped() {
            return false;
        }
        let schema = match http::parse(raw) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting unparseable captured request");
                return false;
            }
        };
        if !host_allowed(&self.allowlist, &schema.host()) {
            tracing::debug!(host = %schema.host(), "Host outside scan allowlist, skipping");
            return false;
        }
        let fingerprint = http::request_fingerprint(&schema);
        let mut state = self.state.lock();
        // stop() drains the queues under this same lock; re-check the flag
        // here so a request can never land in queues already cleared
        if self.is_stopped() {
            return false;
        }
        if !state.seen_fingerprints.insert(fingerprint.clone()) {
            tracing::debug!(%fingerprint, "Duplicate request, skipping");
            return false;
        }
        state.request_queue.push_back(schema);
        true
    }

    /// Halt the scan: drop queued work, force-finalize every active plan,
    /// and seal the envelope. Safe to call more than once.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let plans: Vec<AttackPlan> = {
            let mut state = self.state.lock();
            state.request_queue.clear();
            state.task_queue.clear();
            state.module_locks.clear();
            state.plan_locks.clear();
            state.active_plans.drain().map(|(_, p)| p).collect()
        };
        for plan in plans {
            self.finalize_plan(plan);
        }
        self.envelope.write().seal();
    }

    /// Clear all scheduler state for reuse. The scheduler stays stopped
    /// until `start` is called again.
    pub fn reset(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        *self.state.lock() = SchedulerState::default();
        *self.bucket.lock() = TokenBucket::new(self.settings.max_requests_per_second);
    }

    /// Wait until no queued or in-flight work remains. Returns false on
    /// timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let queues_empty = {
                let state = self.state.lock();
                state.request_queue.is_empty()
                    && state.task_queue.is_empty()
                    && state.active_plans.is_empty()
            };
            if queues_empty && self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Out-of-band execution confirmation keyed by an action token planted
    /// in an earlier attack. Upgrades the matching result, whether it is
    /// still buffered on an active plan or already attached to a finalized
    /// request record, and records it if nothing was recorded yet.
    pub fn confirm_execution(&self, token: &str) {
        if self.confirm_on_active_plan(token) {
            return;
        }
        if self.confirm_on_finalized_record(token) {
            return;
        }
        tracing::debug!(%token, "No attack matches confirmation token");
    }

    fn confirm_on_active_plan(&self, token: &str) -> bool {
        let mut state = self.state.lock();
        let mut hit: Option<(String, usize)> = None;
        'outer: for (plan_id, plan) in state.active_plans.iter() {
            for (idx, attack) in plan.attacks.iter().enumerate() {
                if attack.oob_token.as_deref() == Some(token) {
                    hit = Some((plan_id.clone(), idx));
                    break 'outer;
                }
            }
        }
        let Some((plan_id, idx)) = hit else {
            return false;
        };
        if let Some(plan) = state.active_plans.get_mut(&plan_id) {
            let original_url = plan.original.request.url.clone();
            if let Some(result) = plan.attacks.get_mut(idx) {
                upgrade_result(result);
                if !result.recorded {
                    self.aggregator.record_if_successful(result, &original_url);
                }
            }
        }
        true
    }

    fn confirm_on_finalized_record(&self, token: &str) -> bool {
        // mutate the stored record first, then aggregate on a detached
        // copy; the aggregator needs the envelope lock itself
        let hit = {
            let mut envelope = self.envelope.write();
            let mut hit = None;
            'outer: for (rec_idx, record) in envelope.requests.iter_mut().enumerate() {
                for (atk_idx, attack) in record.attacks.iter_mut().enumerate() {
                    if attack.oob_token.as_deref() == Some(token) {
                        upgrade_result(attack);
                        hit = Some((rec_idx, atk_idx, record.url.clone(), attack.clone()));
                        break 'outer;
                    }
                }
            }
            hit
        };
        let Some((rec_idx, atk_idx, url, mut detached)) = hit else {
            return false;
        };
        if !detached.recorded
            && self
                .aggregator
                .record_if_successful(&mut detached, &url)
                .is_some()
        {
            let mut envelope = self.envelope.write();
            if let Some(record) = envelope.requests.get_mut(rec_idx) {
                if let Some(finding_id) = detached.finding_id.clone() {
                    record.finding_ids.push(finding_id);
                }
                if let Some(attack) = record.attacks.get_mut(atk_idx) {
                    attack.finding_id = detached.finding_id.clone();
                    attack.recorded = true;
                }
            }
        }
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "Worker started");
        loop {
            if self.is_stopped() {
                break;
            }
            let (work, finalize, skipped) = self.next_work();
            if skipped > 0 {
                self.envelope.write().scan_stats.skipped_due_to_strategy += skipped;
            }
            for plan in finalize {
                self.finalize_plan(plan);
            }
            match work {
                Some(Work::Build(schema)) => {
                    if let Some(plan) = self.builder.build_plan_for_schema(schema).await {
                        self.admit_plan(plan);
                    }
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Work::Run(task)) => {
                    self.run_task(task).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                None => sleep(IDLE_POLL).await,
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Atomically pick the next unit of work. Tasks win over plan
    /// construction. Skipped and orphaned tasks are settled in the same
    /// critical section as the dequeue.
    fn next_work(&self) -> (Option<Work>, Vec<AttackPlan>, usize) {
        let mut finalize = Vec::new();
        let mut skipped = 0usize;
        let mut state = self.state.lock();

        let mut index = 0;
        let mut chosen = None;
        while index < state.task_queue.len() {
            let task = &state.task_queue[index];

            // a vanished plan means stop() or finalization raced us
            if !state.active_plans.contains_key(&task.plan_id) {
                state.task_queue.remove(index);
                continue;
            }

            if let Some(key) = self.stop_key(task) {
                if state.stop_keys.contains(&key) {
                    let task = state.task_queue.remove(index).unwrap();
                    skipped += 1;
                    settle_without_running(&mut state, &task, &mut finalize);
                    continue;
                }
            }

            let runnable = !state.plan_locks.contains(&task.plan_id)
                && (task.module_async || !state.module_locks.contains(&task.module_id));
            if runnable {
                chosen = Some(index);
                break;
            }
            index += 1;
        }

        if let Some(index) = chosen {
            let task = state.task_queue.remove(index).unwrap();
            state.plan_locks.insert(task.plan_id.clone());
            if !task.module_async {
                state.module_locks.insert(task.module_id.clone());
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            return (Some(Work::Run(task)), finalize, skipped);
        }

        if let Some(schema) = state.request_queue.pop_front() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            return (Some(Work::Build(schema)), finalize, skipped);
        }

        (None, finalize, skipped)
    }

    fn admit_plan(&self, mut plan: AttackPlan) {
        let task_count = plan.tasks.len();
        let tasks: Vec<AttackTask> = plan.tasks.drain(..).collect();

        // admission is atomic with respect to stop(): the flag check and
        // the queue insert happen under the same lock stop() drains under
        {
            let mut state = self.state.lock();
            if self.is_stopped() {
                tracing::debug!(plan = %plan.id, "Scheduler stopped, dropping freshly built plan");
                return;
            }
            self.envelope.write().scan_stats.planned += task_count;
            if task_count > 0 {
                state.active_plans.insert(plan.id.clone(), plan);
                state.task_queue.extend(tasks);
                return;
            }
        }

        // a plan with nothing to do finalizes on the spot
        self.finalize_plan(plan);
    }

    async fn run_task(&self, task: AttackTask) {
        let baseline = {
            let state = self.state.lock();
            state
                .active_plans
                .get(&task.plan_id)
                .map(|p| p.original.clone())
        };
        let Some(baseline) = baseline else {
            self.release_locks(&task);
            return;
        };

        // only attack traffic is throttled; passive and in-browser tasks
        // send nothing over the transport themselves
        if task.kind == TaskKind::Active {
            let waited = self.acquire_token().await;
            if waited {
                let mut state = self.state.lock();
                if let Some(plan) = state.active_plans.get_mut(&task.plan_id) {
                    plan.context.rate_limited = true;
                }
            }
            if self.is_stopped() {
                self.release_locks(&task);
                return;
            }
        }

        let result = self.executor.run(&task, &baseline).await;
        self.complete(task, result, &baseline.request.url);
    }

    fn complete(&self, task: AttackTask, mut result: Option<AttackResult>, original_url: &str) {
        self.release_locks(&task);

        // a send that outlived stop() (or a whole stop/start cycle)
        // completes here with its plan gone from the active map; the
        // result is discarded rather than counted against a sealed or
        // fresh envelope
        if !self.state.lock().active_plans.contains_key(&task.plan_id) {
            return;
        }

        if let Some(result) = result.as_mut() {
            {
                let mut envelope = self.envelope.write();
                envelope.scan_stats.executed += 1;
                if task.kind == TaskKind::Active {
                    envelope.stats.attacks_count += 1;
                }
            }

            if result.success {
                let allowed = {
                    let mut state = self.state.lock();
                    let unique_limited = self
                        .modules
                        .get(&task.module_id)
                        .map(|m| !m.definition().metadata.unique)
                        .unwrap_or(false);
                    if unique_limited {
                        state.suppressed.insert(unique_key(&task))
                    } else {
                        true
                    }
                };
                if allowed {
                    let recorded = self
                        .aggregator
                        .record_if_successful(result, original_url)
                        .is_some();
                    if recorded {
                        self.notify_once(&task, result);
                        if self.settings.scan_strategy.stop_on_first_finding() {
                            if let Some(key) = self.stop_key(&task) {
                                self.state.lock().stop_keys.insert(key);
                            }
                        }
                    }
                }
            }
        }

        let finalize = {
            let mut state = self.state.lock();
            let mut finalize = None;
            if let Some(plan) = state.active_plans.get_mut(&task.plan_id) {
                if let Some(result) = result {
                    plan.attacks.push(result);
                }
                plan.context
                    .last_executed
                    .insert(task.module_id.clone(), Utc::now());
                plan.pending = plan.pending.saturating_sub(1);
                if plan.pending == 0 {
                    finalize = state.active_plans.remove(&task.plan_id);
                }
            }
            finalize
        };
        if let Some(plan) = finalize {
            self.finalize_plan(plan);
        }
    }

    /// Finalization: re-sort buffered results into build order, strip the
    /// ordering scratch, and attach the per-request record. The plan has
    /// already left the active map, so this can never run twice.
    fn finalize_plan(&self, mut plan: AttackPlan) {
        plan.sort_results();
        let finding_ids: Vec<String> = plan
            .attacks
            .iter()
            .filter_map(|a| a.finding_id.clone())
            .collect();
        tracing::debug!(
            plan = %plan.id,
            attacks = plan.attacks.len(),
            rate_limited = plan.context.rate_limited,
            "Plan finalized"
        );
        let record = RequestRecord {
            plan_id: plan.id.clone(),
            url: plan.original.request.url.clone(),
            method: plan.original.request.method.clone(),
            fingerprint: plan.fingerprint.clone(),
            attacks_count: plan.attacks.len(),
            finding_ids,
            attacks: plan.attacks,
        };
        self.envelope.write().requests.push(record);
    }

    /// Announce each (module, param) hit at most once per plan. Repeat
    /// occurrences still land in the envelope, they just aren't re-logged.
    fn notify_once(&self, task: &AttackTask, result: &AttackResult) {
        let key = format!(
            "{}|{}",
            task.module_id,
            result.param.as_deref().unwrap_or("")
        );
        let mut state = self.state.lock();
        if let Some(plan) = state.active_plans.get_mut(&task.plan_id) {
            if plan.context.notified.insert(key) {
                tracing::info!(
                    module = %task.module_id,
                    url = %result.url,
                    param = result.param.as_deref().unwrap_or(""),
                    "Finding recorded"
                );
            }
        }
    }

    fn release_locks(&self, task: &AttackTask) {
        let mut state = self.state.lock();
        state.plan_locks.remove(&task.plan_id);
        if !task.module_async {
            state.module_locks.remove(&task.module_id);
        }
    }

    /// Wait for a rate-limit token. Returns whether any waiting happened.
    async fn acquire_token(&self) -> bool {
        let mut waited = false;
        loop {
            if self.bucket.lock().try_take() {
                return waited;
            }
            waited = true;
            sleep(RATE_POLL).await;
            if self.is_stopped() {
                return waited;
            }
        }
    }

    /// Strategy skip key for stop-on-first-finding, or `None` when the
    /// strategy never short-circuits
    fn stop_key(&self, task: &AttackTask) -> Option<String> {
        match self.settings.scan_strategy.dedup_scope() {
            DedupScope::None => None,
            DedupScope::UrlModule => {
                Some(format!("{}|{}", task.url_fingerprint, task.module_id))
            }
            DedupScope::UrlModuleParam => Some(format!(
                "{}|{}|{}",
                task.url_fingerprint,
                task.module_id,
                task_param(task).unwrap_or_default()
            )),
        }
    }
}

fn upgrade_result(result: &mut AttackResult) {
    result.success = true;
    result.execution_confirmed = true;
    result.signals.push("oob-confirmed".to_string());
}

/// Identity for unique-limited success accounting. Active attacks suppress
/// globally by attack key; passive rules stay scoped to the location.
fn unique_key(task: &AttackTask) -> String {
    match task.kind {
        TaskKind::Passive => format!("{}|{}", task.attack_key, task.url_fingerprint),
        _ => task.attack_key.clone(),
    }
}

/// Domain allowlist check. An empty allowlist admits everything; entries
/// match the host exactly or as a parent domain.
fn host_allowed(allowlist: &[String], host: &str) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let host = host
        .split(':')
        .next()
        .unwrap_or(host)
        .to_ascii_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{}", entry))
    })
}

fn task_param(task: &AttackTask) -> Option<String> {
    match &task.payload {
        TaskPayload::Active(mutated) => mutated.mutations.first().map(|m| m.name.clone()),
        TaskPayload::Spa(request) => Some(request.param.clone()),
        TaskPayload::Passive => None,
    }
}

/// Settle a task that will never run: count down its plan and collect the
/// plan for finalization when it was the last one.
fn settle_without_running(
    state: &mut SchedulerState,
    task: &AttackTask,
    finalize: &mut Vec<AttackPlan>,
) {
    if let Some(plan) = state.active_plans.get_mut(&task.plan_id) {
        plan.pending = plan.pending.saturating_sub(1);
        if plan.pending == 0 {
            if let Some(plan) = state.active_plans.remove(&task.plan_id) {
                finalize.push(plan);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_per_window() {
        let mut bucket = TokenBucket::new(2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }

    #[test]
    fn test_host_allowlist_matching() {
        let allow = vec!["example.com".to_string()];
        assert!(host_allowed(&allow, "example.com"));
        assert!(host_allowed(&allow, "www.example.com"));
        assert!(host_allowed(&allow, "Example.com:8443"));
        assert!(!host_allowed(&allow, "notexample.com"));
        assert!(!host_allowed(&allow, "example.com.evil.net"));
        assert!(host_allowed(&[], "anything.test"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_no_refill_within_window() {
        let mut bucket = TokenBucket::new(1);
        assert!(bucket.try_take());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!bucket.try_take());
    }
}
