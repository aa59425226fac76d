//! Queue processor: the top-level task scheduler.
//!
//! The processor accepts tasks, orders them by priority then submission
//! order, and runs them on a fixed pool of `max_concurrent` workers. Around
//! each execution it composes the other components:
//! - Admission: budget check, isolation check, tenant resource bundle
//! - Execution: bulkhead slot, timeout, graceful degradation for read-like kinds
//! - Bookkeeping: spend, component health, result table
//!
//! Admission failures are returned from `submit` and never reach a worker.

use foundry_core::{
    BudgetMonitor, DegradationConfig, ErrorCode, OrchestrationConfig, OrchestrationError,
    QueueConfig, ResourceAllocator, ResourceBundle, ResourceRequirements, SpendingRecord, Task,
    TaskId, TaskKind, TaskResult, TaskState,
};
use futures::future::join_all;
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::operation::{Operation, OperationError};
use crate::resilience::{
    AutoRecovery, CascadeProtection, ComponentState, DegradedResponse, GracefulDegradation,
};

/// Why a single execution attempt failed.
#[derive(Error, Debug)]
enum AttemptError {
    #[error("{0}")]
    Failed(OperationError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl AttemptError {
    fn code(&self) -> ErrorCode {
        match self {
            AttemptError::Failed(_) => ErrorCode::OperationFailed,
            AttemptError::TimedOut(_) => ErrorCode::OperationTimeout,
        }
    }
}

/// Queue and execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,

    /// completed / (completed + failed)
    pub success_rate: f64,

    /// Mean execution time of finished tasks, in seconds
    pub avg_execution_time: f64,

    pub total_cost: f64,

    /// Highest number of simultaneously running tasks observed
    pub peak_running: usize,
}

#[derive(Debug, Default)]
struct Totals {
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_cost: f64,
    total_execution_time: f64,
}

struct QueuedTask {
    priority: foundry_core::Priority,
    sequence: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct LiveTask {
    task: Task,
    state: TaskState,
}

struct Shared {
    config: QueueConfig,
    default_requirements: ResourceRequirements,
    degradation_config: DegradationConfig,

    allocator: Arc<ResourceAllocator>,
    budget: Arc<BudgetMonitor>,
    cascade: Arc<CascadeProtection>,
    recovery: Arc<AutoRecovery>,

    operations: RwLock<HashMap<String, Arc<dyn Operation>>>,
    degraders: RwLock<HashMap<String, Arc<GracefulDegradation>>>,

    queue: Mutex<BinaryHeap<QueuedTask>>,
    ready: Semaphore,
    sequence: AtomicU64,
    live: Mutex<HashMap<TaskId, LiveTask>>,
    results: Cache<TaskId, TaskResult>,

    running: AtomicUsize,
    peak_running: AtomicUsize,
    totals: Mutex<Totals>,
    accepting: AtomicBool,
}

/// Bounded worker pool over a priority queue of tasks.
pub struct QueueProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl QueueProcessor {
    /// Create a processor wired to the shared components.
    pub fn new(
        config: &OrchestrationConfig,
        allocator: Arc<ResourceAllocator>,
        budget: Arc<BudgetMonitor>,
        cascade: Arc<CascadeProtection>,
        recovery: Arc<AutoRecovery>,
    ) -> Self {
        let results = Cache::builder()
            .time_to_live(config.queue.result_ttl)
            .build();

        let shared = Shared {
            config: config.queue.clone(),
            default_requirements: config.resources.default_requirements.clone(),
            degradation_config: config.degradation.clone(),
            allocator,
            budget,
            cascade,
            recovery,
            operations: RwLock::new(HashMap::new()),
            degraders: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            ready: Semaphore::new(0),
            sequence: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            results,
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            totals: Mutex::new(Totals::default()),
            accepting: AtomicBool::new(true),
        };

        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the operation that runs tasks of `kind`.
    pub fn register_operation(&self, kind: TaskKind, operation: Arc<dyn Operation>) {
        let component = kind.component().to_string();
        self.shared.cascade.register_component(&component);
        self.shared.operations.write().insert(component, operation);
    }

    /// Allocate a tenant's resources up front with explicit requirements.
    pub fn provision_tenant(
        &self,
        tenant_id: &str,
        requirements: &ResourceRequirements,
    ) -> Result<ResourceBundle, OrchestrationError> {
        Ok(self.shared.allocator.allocate(tenant_id, requirements)?)
    }

    /// Release a tenant's resources. Later tasks for the tenant re-provision.
    pub fn teardown_tenant(&self, tenant_id: &str) -> Option<ResourceBundle> {
        self.shared.allocator.deallocate(tenant_id)
    }

    /// Validate, admit and enqueue a task.
    pub fn submit(&self, task: Task) -> Result<TaskId, OrchestrationError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::Acquire) {
            return Err(OrchestrationError::ShuttingDown);
        }
        shared.validate(&task)?;

        if !shared.budget.can_proceed(&task.tenant_id, task.estimated_cost) {
            tracing::info!(
                tenant = %task.tenant_id,
                estimated_cost = task.estimated_cost,
                "Task denied by budget admission"
            );
            return Err(OrchestrationError::BudgetExceeded {
                tenant_id: task.tenant_id.clone(),
                estimated_cost: task.estimated_cost,
            });
        }

        let component = task.component().to_string();
        if !shared.admits(&component) {
            return Err(OrchestrationError::ComponentIsolated(component));
        }

        shared
            .allocator
            .ensure_allocated(&task.tenant_id, &shared.default_requirements)?;

        let id = task.id.clone();
        {
            let mut live = shared.live.lock();
            if live.contains_key(&id) || shared.results.contains_key(&id) {
                return Err(OrchestrationError::InvalidTask(format!(
                    "duplicate task id '{}'",
                    id
                )));
            }
            live.insert(
                id.clone(),
                LiveTask {
                    task: task.clone(),
                    state: TaskState::Queued,
                },
            );
        }

        let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed);
        shared.queue.lock().push(QueuedTask {
            priority: task.priority,
            sequence,
            task,
        });
        shared.ready.add_permits(1);

        tracing::debug!(task = %id, "Task queued");
        Ok(id)
    }

    /// Result of a finished task. Does not remove it.
    pub fn get_result(&self, task_id: &str) -> Option<TaskResult> {
        self.shared.results.get(task_id)
    }

    /// Collect a finished task's result and evict it.
    pub fn take_result(&self, task_id: &str) -> Option<TaskResult> {
        self.shared.results.remove(task_id)
    }

    /// Lifecycle state of a task still tracked by the processor.
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        if let Some(live) = self.shared.live.lock().get(task_id) {
            return Some(live.state);
        }
        self.shared.results.get(task_id).map(|r| r.state())
    }

    /// Spawn the worker pool. No-op if running or stopped.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || !self.shared.accepting.load(Ordering::Acquire) {
            return;
        }
        for worker_id in 0..self.shared.config.max_concurrent {
            let shared = Arc::clone(&self.shared);
            let token = self.shutdown.clone();
            workers.push(tokio::spawn(worker_loop(shared, token, worker_id)));
        }
        tracing::info!(workers = self.shared.config.max_concurrent, "Queue processor started");
    }

    /// Stop accepting work, let in-flight tasks finish within the grace
    /// period, then cancel whatever is left.
    pub async fn stop(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shutdown.cancel();

        let cancelled_queued = self.shared.cancel_queued();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let grace = self.shared.config.shutdown_grace;
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            tracing::warn!(grace = ?grace, "Shutdown grace period elapsed, cancelling in-flight tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        let cancelled_running = self.shared.cancel_running();
        self.shared.ready.close();

        tracing::info!(
            cancelled_queued,
            cancelled_running,
            "Queue processor stopped"
        );
    }

    /// Whether the processor still accepts submissions.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Queue and execution counters.
    pub fn stats(&self) -> ProcessorStats {
        let queued = self
            .shared
            .live
            .lock()
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .count();
        let totals = self.shared.totals.lock();
        let finished = totals.completed + totals.failed;

        ProcessorStats {
            queued,
            running: self.shared.running.load(Ordering::Acquire),
            completed: totals.completed,
            failed: totals.failed,
            cancelled: totals.cancelled,
            success_rate: ratio(totals.completed as f64, finished as f64),
            avg_execution_time: ratio(totals.total_execution_time, finished as f64),
            total_cost: totals.total_cost,
            peak_running: self.shared.peak_running.load(Ordering::Acquire),
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in self.workers.lock().iter() {
            handle.abort();
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, token: CancellationToken, worker_id: usize) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = shared.ready.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        permit.forget();

        let next = shared.queue.lock().pop();
        if let Some(queued) = next {
            shared.run(queued.task, worker_id).await;
        }
    }
    tracing::debug!(worker_id, "Worker exiting");
}

impl Shared {
    fn validate(&self, task: &Task) -> Result<(), OrchestrationError> {
        if task.id.trim().is_empty() {
            return Err(OrchestrationError::InvalidTask("task id is empty".into()));
        }
        if task.tenant_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidTask("tenant id is empty".into()));
        }
        if task.component().trim().is_empty() {
            return Err(OrchestrationError::InvalidTask("task kind is empty".into()));
        }
        if !task.estimated_cost.is_finite() || task.estimated_cost < 0.0 {
            return Err(OrchestrationError::InvalidTask(format!(
                "estimated cost must be a non-negative number, got {}",
                task.estimated_cost
            )));
        }
        if !self.operations.read().contains_key(task.component()) {
            return Err(OrchestrationError::InvalidTask(format!(
                "no operation registered for kind '{}'",
                task.kind
            )));
        }
        Ok(())
    }

    /// Cascade protection gate, with weighted routing during recovery.
    fn admits(&self, component: &str) -> bool {
        match self.cascade.state(component) {
            ComponentState::Recovery => self.recovery.should_route_to_component(component),
            _ => self.cascade.is_available(component),
        }
    }

    async fn run(&self, task: Task, worker_id: usize) {
        {
            let mut live = self.live.lock();
            match live.get_mut(&task.id) {
                Some(entry) if entry.state == TaskState::Queued => entry.state = TaskState::Running,
                // Cancelled while waiting.
                _ => return,
            }
        }
        let now_running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running.fetch_max(now_running, Ordering::AcqRel);
        tracing::debug!(task = %task.id, worker_id, kind = %task.kind, "Task running");

        let result = self.execute(&task).await;
        self.finish(&task, result);
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        let started = Instant::now();
        let component = task.component().to_string();

        // The task may have waited long enough for its admission to lapse.
        if !self.budget.can_proceed(&task.tenant_id, task.estimated_cost) {
            return TaskResult::failure(
                task,
                ErrorCode::BudgetExceeded,
                "budget exhausted while queued",
                0.0,
                0.0,
            );
        }
        if !self.admits(&component) {
            return TaskResult::failure(
                task,
                ErrorCode::ComponentIsolated,
                format!("component '{}' is isolated", component),
                0.0,
                0.0,
            );
        }

        let _permit = match &task.dependency {
            Some(dependency) => match self.cascade.try_dependency_permit(dependency) {
                Some(permit) => Some(permit),
                None => {
                    return TaskResult::failure(
                        task,
                        ErrorCode::DependencyAtCapacity,
                        format!("dependency '{}' is at capacity", dependency),
                        0.0,
                        0.0,
                    )
                }
            },
            None => None,
        };

        let Some(operation) = self.operations.read().get(&component).cloned() else {
            return TaskResult::failure(
                task,
                ErrorCode::InvalidTask,
                format!("no operation registered for kind '{}'", task.kind),
                0.0,
                0.0,
            );
        };

        let bundle = match self
            .allocator
            .ensure_allocated(&task.tenant_id, &self.default_requirements)
        {
            Ok(bundle) => bundle,
            Err(err) => {
                return TaskResult::failure(
                    task,
                    ErrorCode::ResourceExhausted,
                    err.to_string(),
                    0.0,
                    0.0,
                )
            }
        };

        let incurred = Mutex::new(0.0_f64);
        let timeout = self.config.task_timeout;
        let (op, bundle_ref, incurred_ref) = (operation.as_ref(), &bundle, &incurred);
        let attempt = move || async move {
            match tokio::time::timeout(timeout, op.run(task, bundle_ref)).await {
                Ok(Ok(out)) => {
                    *incurred_ref.lock() = out.cost;
                    Ok(out.output)
                }
                Ok(Err(err)) => {
                    *incurred_ref.lock() = err.cost;
                    Err(AttemptError::Failed(err))
                }
                Err(_) => Err(AttemptError::TimedOut(timeout)),
            }
        };

        let outcome = if task.kind.is_idempotent() {
            self.degrader(&component)
                .execute(&cache_key(task), attempt)
                .await
        } else {
            attempt().await.map(DegradedResponse::Fresh)
        };

        let cost = incurred.into_inner().max(0.0);
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(DegradedResponse::Fresh(output)) => {
                self.cascade.record_success(&component);
                TaskResult::success(task, output, cost, elapsed)
            }
            Ok(degraded) => {
                self.cascade.record_failure(&component);
                TaskResult::success(task, degraded.into_value(), cost, elapsed).degraded()
            }
            Err(err) => {
                self.cascade.record_failure(&component);
                tracing::warn!(task = %task.id, kind = %task.kind, error = %err, "Task failed");
                TaskResult::failure(task, err.code(), err.to_string(), cost, elapsed)
            }
        }
    }

    fn finish(&self, task: &Task, result: TaskResult) {
        // Whoever removes the live entry owns the terminal transition.
        if self.live.lock().remove(&task.id).is_none() {
            return;
        }
        self.running.fetch_sub(1, Ordering::AcqRel);

        if let Err(err) = self.budget.record_spending(SpendingRecord::new(
            task.tenant_id.clone(),
            result.cost,
            task.id.clone(),
        )) {
            tracing::error!(task = %task.id, error = %err, "Failed to record spending");
        }

        {
            let mut totals = self.totals.lock();
            if result.success {
                totals.completed += 1;
            } else {
                totals.failed += 1;
            }
            totals.total_cost += result.cost;
            totals.total_execution_time += result.execution_time_seconds;
        }

        tracing::debug!(
            task = %task.id,
            success = result.success,
            degraded = result.degraded,
            cost = result.cost,
            "Task finished"
        );
        self.results.insert(task.id.clone(), result);
    }

    fn cancel_queued(&self) -> usize {
        let drained: Vec<QueuedTask> = self.queue.lock().drain().collect();
        let mut cancelled = 0;
        for queued in drained {
            let removed = {
                let mut live = self.live.lock();
                match live.get(&queued.task.id) {
                    Some(entry) if entry.state == TaskState::Queued => {
                        live.remove(&queued.task.id).is_some()
                    }
                    _ => false,
                }
            };
            if removed {
                self.store_cancelled(&queued.task);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn cancel_running(&self) -> usize {
        let leftovers: Vec<LiveTask> = self.live.lock().drain().map(|(_, t)| t).collect();
        let mut cancelled = 0;
        for entry in leftovers {
            if entry.state == TaskState::Running {
                self.running.fetch_sub(1, Ordering::AcqRel);
            }
            self.store_cancelled(&entry.task);
            cancelled += 1;
        }
        cancelled
    }

    fn store_cancelled(&self, task: &Task) {
        self.totals.lock().cancelled += 1;
        self.results
            .insert(task.id.clone(), TaskResult::cancelled(task));
    }

    fn degrader(&self, component: &str) -> Arc<GracefulDegradation> {
        if let Some(degrader) = self.degraders.read().get(component) {
            return Arc::clone(degrader);
        }
        Arc::clone(
            self.degraders
                .write()
                .entry(component.to_string())
                .or_insert_with(|| {
                    Arc::new(GracefulDegradation::new(component, &self.degradation_config))
                }),
        )
    }
}

fn cache_key(task: &Task) -> String {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    task.payload.to_string().hash(&mut hasher);
    format!(
        "{}:{}:{:016x}",
        task.tenant_id,
        task.component(),
        hasher.finish()
    )
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
