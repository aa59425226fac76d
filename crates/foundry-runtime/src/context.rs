//! The orchestration context: one explicit owner for every component.

use std::sync::Arc;

use foundry_core::{
    BudgetMonitor, ConfigError, OrchestrationConfig, OrchestrationError, ResourceAllocator,
    Task, TaskId, TaskKind,
};

use crate::operation::{HealthCheck, Operation};
use crate::processor::QueueProcessor;
use crate::report::ResilienceReport;
use crate::resilience::{AutoRecovery, CascadeProtection};

/// Wires the allocator, budget monitor, cascade protection, auto recovery
/// and queue processor from a single configuration.
pub struct OrchestrationContext {
    config: OrchestrationConfig,
    allocator: Arc<ResourceAllocator>,
    budget: Arc<BudgetMonitor>,
    cascade: Arc<CascadeProtection>,
    recovery: Arc<AutoRecovery>,
    processor: QueueProcessor,
}

impl OrchestrationContext {
    /// Build a context with no operations registered.
    pub fn new(config: OrchestrationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let allocator = Arc::new(ResourceAllocator::new(&config.resources));
        let budget = Arc::new(BudgetMonitor::new(config.budget.default_limit.clone()));
        let cascade = Arc::new(CascadeProtection::new(config.cascade.clone()));
        let recovery = Arc::new(AutoRecovery::new(
            config.recovery.clone(),
            Arc::clone(&cascade),
        ));
        let processor = QueueProcessor::new(
            &config,
            Arc::clone(&allocator),
            Arc::clone(&budget),
            Arc::clone(&cascade),
            Arc::clone(&recovery),
        );

        Ok(Self {
            config,
            allocator,
            budget,
            cascade,
            recovery,
            processor,
        })
    }

    pub fn builder() -> OrchestrationContextBuilder {
        OrchestrationContextBuilder::new()
    }

    /// Start the worker pool and the recovery monitor.
    pub fn start(&self) {
        self.processor.start();
        self.recovery.start_monitoring();
    }

    /// Stop the worker pool (honoring the grace period) and the monitor.
    pub async fn shutdown(&self) {
        self.processor.stop().await;
        self.recovery.stop_monitoring().await;
    }

    pub fn submit(&self, task: Task) -> Result<TaskId, OrchestrationError> {
        self.processor.submit(task)
    }

    pub fn resilience_report(&self) -> ResilienceReport {
        ResilienceReport::collect(&self.cascade, &self.recovery, self.processor.stats())
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn budget(&self) -> &Arc<BudgetMonitor> {
        &self.budget
    }

    pub fn cascade(&self) -> &Arc<CascadeProtection> {
        &self.cascade
    }

    pub fn recovery(&self) -> &Arc<AutoRecovery> {
        &self.recovery
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }
}

/// Builder for OrchestrationContext.
pub struct OrchestrationContextBuilder {
    config: OrchestrationConfig,
    operations: Vec<(TaskKind, Arc<dyn Operation>)>,
    health_checks: Vec<(String, Arc<dyn HealthCheck>)>,
}

impl OrchestrationContextBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestrationConfig::default(),
            operations: Vec::new(),
            health_checks: Vec::new(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the operation behind a task kind.
    pub fn operation(mut self, kind: TaskKind, operation: Arc<dyn Operation>) -> Self {
        self.operations.push((kind, operation));
        self
    }

    /// Register a health check used to recover a component.
    pub fn health_check(mut self, component: impl Into<String>, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push((component.into(), check));
        self
    }

    /// Validate the configuration and build the context.
    pub fn build(self) -> Result<OrchestrationContext, ConfigError> {
        let context = OrchestrationContext::new(self.config)?;
        for (kind, operation) in self.operations {
            context.processor.register_operation(kind, operation);
        }
        for (component, check) in self.health_checks {
            context.recovery.register_health_check(&component, check);
        }
        Ok(context)
    }
}

impl Default for OrchestrationContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
