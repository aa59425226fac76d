//! # foundry-runtime
//!
//! Async execution engine for the Foundry orchestrator.
//!
//! This crate runs tenant tasks on a bounded tokio worker pool and keeps one
//! misbehaving component from taking the others down:
//! - `QueueProcessor`: priority queue, concurrency ceiling, admission control
//! - `CascadeProtection`: circuit breaking with per-dependency bulkheads
//! - `GracefulDegradation`: cached or synthetic answers during outages
//! - `AutoRecovery`: health-checked, gradual return to service
//!
//! ## Example
//!
//! ```rust,ignore
//! use foundry_runtime::{OrchestrationContext, FnOperation, OperationOutput};
//! use foundry_core::{OrchestrationConfig, Task, TaskKind};
//!
//! let context = OrchestrationContext::builder()
//!     .config(OrchestrationConfig::from_file("foundry.yaml")?)
//!     .operation(TaskKind::BusinessPlan, Arc::new(FnOperation::new("plan", |task, _| async move {
//!         Ok(OperationOutput::new(serde_json::json!({"tenant": task.tenant_id}), 0.02))
//!     })))
//!     .build()?;
//!
//! context.start();
//! let id = context.submit(Task::new("acme", TaskKind::BusinessPlan))?;
//! ```

pub mod context;
pub mod operation;
pub mod processor;
pub mod report;
pub mod resilience;

pub use context::{OrchestrationContext, OrchestrationContextBuilder};
pub use operation::{
    health_check_fn, FnHealthCheck, FnOperation, HealthCheck, Operation, OperationError,
    OperationOutput,
};
pub use processor::{ProcessorStats, QueueProcessor};
pub use report::ResilienceReport;
pub use resilience::{
    AutoRecovery, Bulkhead, CascadeProtection, ComponentSnapshot, ComponentState,
    DegradedResponse, DependencyPermit, GracefulDegradation, RecoveryOutcome,
};
