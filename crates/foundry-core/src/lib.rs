//! # foundry-core
//!
//! Deterministic building blocks of the Foundry orchestrator.
//!
//! This crate holds everything that does not need an async runtime:
//! - The task model (`Task`, `TaskResult`, `TaskState`)
//! - The error taxonomy shared by every component
//! - Typed, validated configuration
//! - The conflict-free `ResourceAllocator`
//! - The spend-based `BudgetMonitor` used for admission control
//!
//! ## Example
//!
//! ```rust,ignore
//! use foundry_core::{BudgetMonitor, BudgetLimit, ResourceAllocator, ResourceRequirements};
//!
//! let allocator = ResourceAllocator::with_port_window(9000, 100);
//! let bundle = allocator.allocate("acme", &ResourceRequirements::default())?;
//!
//! let budget = BudgetMonitor::default();
//! budget.set_limit("acme", BudgetLimit::uniform(5.0))?;
//! assert!(budget.can_proceed("acme", 0.25));
//! ```

pub mod budget;
pub mod config;
pub mod error;
pub mod resources;
pub mod task;

pub use budget::{
    BudgetError, BudgetLimit, BudgetMonitor, BudgetStatus, SpendingRecord, SpendingTotals,
    WindowFlags,
};
pub use config::{
    BudgetConfig, CascadeConfig, ConfigError, DegradationConfig, OrchestrationConfig,
    QueueConfig, RecoveryConfig, ResourceConfig,
};
pub use error::{ErrorCode, OrchestrationError};
pub use resources::{
    ResourceAllocator, ResourceBundle, ResourceError, ResourceRequirements, ResourceUsage,
};
pub use task::{Priority, Task, TaskId, TaskKind, TaskResult, TaskState};
