//! Task model: what callers submit and what workers hand back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Identifier of a submitted task.
pub type TaskId = String;

/// Kind of pipeline step a task performs.
///
/// The kind doubles as the component name used for cascade protection,
/// so every task of the same kind shares one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    MarketResearch,
    BusinessPlan,
    ProjectScaffold,
    CodeGeneration,
    Deployment,
    Custom(String),
}

impl TaskKind {
    /// Component name used by cascade protection and recovery.
    pub fn component(&self) -> &str {
        match self {
            TaskKind::MarketResearch => "market_research",
            TaskKind::BusinessPlan => "business_plan",
            TaskKind::ProjectScaffold => "project_scaffold",
            TaskKind::CodeGeneration => "code_generation",
            TaskKind::Deployment => "deployment",
            TaskKind::Custom(name) => name.as_str(),
        }
    }

    /// Read-like kinds that may be answered from the fallback cache.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, TaskKind::MarketResearch | TaskKind::BusinessPlan)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component())
    }
}

/// Scheduling priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// One unit of work. Never mutated after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Tenant ("startup") that owns the task
    pub tenant_id: String,

    /// Pipeline step
    pub kind: TaskKind,

    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Opaque input for the operation
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Expected spend, checked against the tenant's budget before running
    #[serde(default)]
    pub estimated_cost: f64,

    /// External dependency the operation calls (bulkhead key)
    #[serde(default)]
    pub dependency: Option<String>,

    /// When the task was created
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a fresh id, medium priority and an empty payload.
    pub fn new(tenant_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            kind,
            priority: Priority::default(),
            payload: serde_json::Value::Null,
            estimated_cost: 0.0,
            dependency: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    /// Component name for cascade protection.
    pub fn component(&self) -> &str {
        self.kind.component()
    }
}

/// Lifecycle of a task inside the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states never change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Outcome of one task, written once by the worker that ran it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub tenant_id: String,
    pub success: bool,

    /// Opaque operation output (or fallback output when degraded)
    #[serde(default)]
    pub output: serde_json::Value,

    /// Actual spend
    pub cost: f64,

    pub execution_time_seconds: f64,

    /// Taxonomy code when the task did not succeed
    #[serde(default)]
    pub error: Option<ErrorCode>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Output came from the fallback cache or a synthetic response
    #[serde(default)]
    pub degraded: bool,

    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Successful result.
    pub fn success(task: &Task, output: serde_json::Value, cost: f64, elapsed: f64) -> Self {
        Self {
            task_id: task.id.clone(),
            tenant_id: task.tenant_id.clone(),
            success: true,
            output,
            cost: cost.max(0.0),
            execution_time_seconds: elapsed.max(0.0),
            error: None,
            error_message: None,
            degraded: false,
            completed_at: Utc::now(),
        }
    }

    /// Failed result carrying a taxonomy code.
    pub fn failure(
        task: &Task,
        code: ErrorCode,
        message: impl Into<String>,
        cost: f64,
        elapsed: f64,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            tenant_id: task.tenant_id.clone(),
            success: false,
            output: serde_json::Value::Null,
            cost: cost.max(0.0),
            execution_time_seconds: elapsed.max(0.0),
            error: Some(code),
            error_message: Some(message.into()),
            degraded: false,
            completed_at: Utc::now(),
        }
    }

    /// Result for a task that was cancelled before finishing.
    pub fn cancelled(task: &Task) -> Self {
        Self::failure(task, ErrorCode::Cancelled, "task cancelled", 0.0, 0.0)
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    /// Terminal state this result represents.
    pub fn state(&self) -> TaskState {
        match (self.success, self.error) {
            (true, _) => TaskState::Completed,
            (false, Some(ErrorCode::Cancelled)) => TaskState::Cancelled,
            (false, _) => TaskState::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_kind_component_names() {
        assert_eq!(TaskKind::MarketResearch.component(), "market_research");
        assert_eq!(TaskKind::Custom("openai".into()).component(), "openai");
        assert!(TaskKind::BusinessPlan.is_idempotent());
        assert!(!TaskKind::Deployment.is_idempotent());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new("t1", TaskKind::CodeGeneration);
        let b = Task::new("t1", TaskKind::CodeGeneration);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_result_state() {
        let task = Task::new("t1", TaskKind::Deployment);
        assert_eq!(
            TaskResult::success(&task, serde_json::json!({}), 0.1, 1.0).state(),
            TaskState::Completed
        );
        assert_eq!(TaskResult::cancelled(&task).state(), TaskState::Cancelled);
        let failed = TaskResult::failure(&task, ErrorCode::OperationFailed, "boom", 0.0, 0.5);
        assert_eq!(failed.state(), TaskState::Failed);
        assert!(failed.state().is_terminal());
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let json = r#"{
            "id": "abc",
            "tenant_id": "t1",
            "kind": "business_plan",
            "submitted_at": "2025-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.estimated_cost, 0.0);
        assert!(task.dependency.is_none());
    }
}
