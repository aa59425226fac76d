//! Seams to the work the orchestrator runs but does not understand.

use async_trait::async_trait;
use foundry_core::{ResourceBundle, Task};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure reported by an operation.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct OperationError {
    /// What went wrong
    pub message: String,

    /// Spend incurred before the failure (e.g. a billed but rejected call)
    pub cost: f64,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// What an operation hands back on success.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    /// Opaque result payload
    pub output: serde_json::Value,

    /// Actual spend
    pub cost: f64,
}

impl OperationOutput {
    pub fn new(output: serde_json::Value, cost: f64) -> Self {
        Self { output, cost }
    }
}

/// The actual unit of work behind a task kind.
///
/// Implementations call AI providers, render templates, deploy, and so on.
/// The orchestrator only sees the opaque output and the reported cost.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run the task with the tenant's resources.
    async fn run(
        &self,
        task: &Task,
        resources: &ResourceBundle,
    ) -> Result<OperationOutput, OperationError>;

    /// Name for logs.
    fn name(&self) -> &str {
        "operation"
    }
}

/// Cheap, side-effect-free probe of a component.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> bool;
}

/// Health check backed by a synchronous closure.
pub struct FnHealthCheck<F> {
    probe: F,
}

#[async_trait]
impl<F> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn check(&self) -> bool {
        (self.probe)()
    }
}

/// Wrap a closure as a health check.
pub fn health_check_fn<F>(probe: F) -> FnHealthCheck<F>
where
    F: Fn() -> bool + Send + Sync,
{
    FnHealthCheck { probe }
}

type BoxedFuture = Pin<Box<dyn Future<Output = Result<OperationOutput, OperationError>> + Send>>;
type BoxedRun = Box<dyn Fn(Task, ResourceBundle) -> BoxedFuture + Send + Sync>;

/// Operation backed by an async closure.
pub struct FnOperation {
    name: String,
    run: BoxedRun,
}

impl FnOperation {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Task, ResourceBundle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationOutput, OperationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |task, resources| Box::pin(run(task, resources))),
        }
    }
}

#[async_trait]
impl Operation for FnOperation {
    async fn run(
        &self,
        task: &Task,
        resources: &ResourceBundle,
    ) -> Result<OperationOutput, OperationError> {
        (self.run)(task.clone(), resources.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
