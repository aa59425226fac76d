//! Error taxonomy shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::budget::BudgetError;
use crate::resources::ResourceError;

/// Errors surfaced to the submitter of a task.
///
/// Admission, resource and isolation errors are decided before any worker
/// slot or operation is used and are never retried by the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Budget exceeded for tenant '{tenant_id}': estimated cost {estimated_cost:.4}")]
    BudgetExceeded { tenant_id: String, estimated_cost: f64 },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Component '{0}' is isolated")]
    ComponentIsolated(String),

    #[error("Dependency '{0}' is at capacity")]
    DependencyAtCapacity(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Resource error: {0}")]
    Resource(ResourceError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),
}

impl OrchestrationError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestrationError::InvalidTask(_) => ErrorCode::InvalidTask,
            OrchestrationError::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            OrchestrationError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            OrchestrationError::ComponentIsolated(_) => ErrorCode::ComponentIsolated,
            OrchestrationError::DependencyAtCapacity(_) => ErrorCode::DependencyAtCapacity,
            OrchestrationError::Operation(_) => ErrorCode::OperationFailed,
            OrchestrationError::ShuttingDown => ErrorCode::Cancelled,
            OrchestrationError::Resource(_) => ErrorCode::ResourceExhausted,
            OrchestrationError::Budget(_) => ErrorCode::InvalidTask,
        }
    }

    /// Whether the caller may retry the same submission later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ResourceExhausted(_)
                | OrchestrationError::ComponentIsolated(_)
                | OrchestrationError::DependencyAtCapacity(_)
        )
    }
}

impl From<ResourceError> for OrchestrationError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Exhausted(reason) => OrchestrationError::ResourceExhausted(reason),
            other => OrchestrationError::Resource(other),
        }
    }
}

/// Serializable error code recorded on a failed `TaskResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidTask,
    BudgetExceeded,
    ResourceExhausted,
    ComponentIsolated,
    DependencyAtCapacity,
    OperationFailed,
    OperationTimeout,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidTask => "invalid_task",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::ComponentIsolated => "component_isolated",
            ErrorCode::DependencyAtCapacity => "dependency_at_capacity",
            ErrorCode::OperationFailed => "operation_failed",
            ErrorCode::OperationTimeout => "operation_timeout",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhaustion_maps_to_taxonomy() {
        let err: OrchestrationError = ResourceError::Exhausted("no ports".into()).into();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_budget_denial_is_not_retryable() {
        let err = OrchestrationError::BudgetExceeded {
            tenant_id: "t1".into(),
            estimated_cost: 0.2,
        };
        assert_eq!(err.code(), ErrorCode::BudgetExceeded);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::DependencyAtCapacity).unwrap();
        assert_eq!(json, "\"dependency_at_capacity\"");
        assert_eq!(ErrorCode::OperationTimeout.to_string(), "operation_timeout");
    }
}
