//! Task storage: the `TaskStore` abstraction and its implementations.
//!
//! The store is the only component that talks to durable storage. All task
//! mutation flows through `transition`, a compare-and-swap keyed on the
//! previously-observed status, so racing writers (transport-driven cancel vs
//! broker-driven reconciliation) cannot lose updates.

mod memory;
mod postgres;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use taskgrid_core::{Task, TaskId, TaskStatus, TaskTransition, TaskType, WorkerId};

/// Storage operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    /// The compare-and-swap precondition failed: another writer moved the
    /// task since it was read.
    #[error("status conflict for {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Filter for task listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

/// Directed dependency edge: `task_id` must wait for `dependency_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    pub dependency_task_id: TaskId,
    pub dependency_type: String,
    pub created_at: DateTime<Utc>,
}

/// Dependency edge joined with the referenced task's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyView {
    pub dependency_task_id: TaskId,
    pub dependency_type: String,
    pub dependency_status: TaskStatus,
    pub dependency_task_type: TaskType,
    pub created_at: DateTime<Utc>,
}

/// A task-to-worker binding. Historical rows are retained for analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub assignment_score: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub assigned_at: DateTime<Utc>,
}

/// Append-only per-task measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub task_id: TaskId,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl Metric {
    pub fn new(task_id: TaskId, name: impl Into<String>, value: f64) -> Self {
        Self {
            task_id,
            name: name.into(),
            value,
            unit: String::new(),
            recorded_at: Utc::now(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl core::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only execution trace line reported by a worker or the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,
    pub worker_id: Option<WorkerId>,
    pub step: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(task_id: TaskId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id,
            level,
            message: message.into(),
            worker_id: None,
            step: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }
}

/// Audit row written on every tracked status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub task_id: TaskId,
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub changed_by: String,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// One hour of the time-bucketed trend breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Window-scoped aggregate statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub window_hours: u32,
    pub total_tasks: u64,
    pub status_counts: BTreeMap<String, u64>,
    /// Duration statistics over successfully completed tasks, in seconds.
    pub avg_duration_seconds: Option<f64>,
    pub min_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<f64>,
    pub avg_retries: f64,
    pub active_workers: u64,
    /// Newest-first hourly breakdown for trend display.
    pub hourly: Vec<HourlyBucket>,
}

impl AnalyticsSummary {
    pub fn completed_tasks(&self) -> u64 {
        self.status_counts
            .get(&TaskStatus::Success.to_string())
            .copied()
            .unwrap_or(0)
    }
}

/// Aggregate statistics scoped to a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub worker_id: WorkerId,
    pub window_hours: u32,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_duration_seconds: Option<f64>,
    pub avg_retries: f64,
    pub first_task_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Persistence abstraction for task records and their satellite tables.
///
/// Implementations must:
/// - apply `transition` atomically with its status-history row
/// - enforce the compare-and-swap precondition on `transition`
/// - keep satellite rows append-only, deleted only via cascading task delete
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new PENDING record.
    async fn create(&self, task: Task) -> Result<TaskId, TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// List tasks newest-first with optional status/type filters.
    async fn list(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Apply a typed transition as a conditional update keyed on
    /// `(id, expected)` and append the audit row. Returns the updated task.
    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<Task, TaskStoreError>;

    /// Hard delete, cascading to all satellite rows. Returns whether the
    /// task existed.
    async fn delete(&self, id: TaskId) -> Result<bool, TaskStoreError>;

    /// Idempotent dependency insert. The referenced task must exist.
    /// Acyclicity is checked by the resolver before calling this.
    async fn add_dependency(
        &self,
        task_id: TaskId,
        dependency_task_id: TaskId,
        dependency_type: &str,
    ) -> Result<(), TaskStoreError>;

    /// Raw outgoing edges of a task (used by the cycle search).
    async fn dependency_edges(&self, task_id: TaskId) -> Result<Vec<Dependency>, TaskStoreError>;

    /// Dependencies joined with current status, ordered by creation time.
    async fn list_dependencies(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DependencyView>, TaskStoreError>;

    /// PENDING tasks whose every dependency is satisfied, ordered by
    /// priority descending then creation time ascending.
    async fn ready_tasks(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError>;

    /// Record a task-to-worker binding and set the task's worker id.
    async fn record_assignment(&self, assignment: WorkerAssignment)
        -> Result<(), TaskStoreError>;

    async fn assignments(
        &self,
        worker_id: Option<&WorkerId>,
        active_only: bool,
    ) -> Result<Vec<WorkerAssignment>, TaskStoreError>;

    async fn record_metric(&self, metric: Metric) -> Result<(), TaskStoreError>;

    async fn metrics_of(&self, task_id: TaskId) -> Result<Vec<Metric>, TaskStoreError>;

    /// Newest-first listing of one named metric across all tasks.
    async fn metrics_by_name(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Metric>, TaskStoreError>;

    async fn record_execution_log(&self, entry: ExecutionLogEntry)
        -> Result<(), TaskStoreError>;

    /// Newest-first execution log for a task.
    async fn execution_logs(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, TaskStoreError>;

    /// Newest-first status audit trail for a task.
    async fn status_history(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<StatusHistoryEntry>, TaskStoreError>;

    /// Aggregate statistics over tasks created within the window.
    async fn summary(&self, window_hours: u32) -> Result<AnalyticsSummary, TaskStoreError>;

    /// The same aggregation scoped to one worker.
    async fn worker_performance(
        &self,
        worker_id: &WorkerId,
        window_hours: u32,
    ) -> Result<WorkerPerformance, TaskStoreError>;
}

#[async_trait::async_trait]
impl<S> TaskStore for std::sync::Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn create(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        (**self).create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(id).await
    }

    async fn list(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list(filter, limit, offset).await
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<Task, TaskStoreError> {
        (**self)
            .transition(id, expected, transition, changed_by, reason)
            .await
    }

    async fn delete(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        (**self).delete(id).await
    }

    async fn add_dependency(
        &self,
        task_id: TaskId,
        dependency_task_id: TaskId,
        dependency_type: &str,
    ) -> Result<(), TaskStoreError> {
        (**self)
            .add_dependency(task_id, dependency_task_id, dependency_type)
            .await
    }

    async fn dependency_edges(&self, task_id: TaskId) -> Result<Vec<Dependency>, TaskStoreError> {
        (**self).dependency_edges(task_id).await
    }

    async fn list_dependencies(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DependencyView>, TaskStoreError> {
        (**self).list_dependencies(task_id).await
    }

    async fn ready_tasks(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        (**self).ready_tasks(limit).await
    }

    async fn record_assignment(
        &self,
        assignment: WorkerAssignment,
    ) -> Result<(), TaskStoreError> {
        (**self).record_assignment(assignment).await
    }

    async fn assignments(
        &self,
        worker_id: Option<&WorkerId>,
        active_only: bool,
    ) -> Result<Vec<WorkerAssignment>, TaskStoreError> {
        (**self).assignments(worker_id, active_only).await
    }

    async fn record_metric(&self, metric: Metric) -> Result<(), TaskStoreError> {
        (**self).record_metric(metric).await
    }

    async fn metrics_of(&self, task_id: TaskId) -> Result<Vec<Metric>, TaskStoreError> {
        (**self).metrics_of(task_id).await
    }

    async fn metrics_by_name(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Metric>, TaskStoreError> {
        (**self).metrics_by_name(name, limit).await
    }

    async fn record_execution_log(
        &self,
        entry: ExecutionLogEntry,
    ) -> Result<(), TaskStoreError> {
        (**self).record_execution_log(entry).await
    }

    async fn execution_logs(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, TaskStoreError> {
        (**self).execution_logs(task_id, limit).await
    }

    async fn status_history(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<StatusHistoryEntry>, TaskStoreError> {
        (**self).status_history(task_id).await
    }

    async fn summary(&self, window_hours: u32) -> Result<AnalyticsSummary, TaskStoreError> {
        (**self).summary(window_hours).await
    }

    async fn worker_performance(
        &self,
        worker_id: &WorkerId,
        window_hours: u32,
    ) -> Result<WorkerPerformance, TaskStoreError> {
        (**self).worker_performance(worker_id, window_hours).await
    }
}
