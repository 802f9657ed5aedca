//! Kernel error taxonomy.

use thiserror::Error;

use crate::id::TaskId;
use crate::task::TaskStatus;

/// Result type used across the orchestration kernel.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Orchestrator-level error.
///
/// Validation and not-found errors are surfaced synchronously to callers.
/// Transient failures on best-effort paths (audit writes, broker
/// revoke-on-cancel) are logged and swallowed by the components themselves
/// and never appear here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The requested task type has no dispatch route.
    #[error("unsupported task type: {0}")]
    UnsupportedTaskType(String),

    /// The broker was unreachable or rejected the job.
    ///
    /// During task creation this is absorbed into a FAILURE-status record
    /// rather than returned; it only surfaces from explicit re-dispatch.
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    /// The persistence layer is unavailable. There is no silent in-memory
    /// fallback; callers observe degraded mode explicitly.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A retry was requested past the task's retry budget.
    #[error("retries exhausted for task {task_id} (max_retries = {max_retries})")]
    RetriesExhausted { task_id: TaskId, max_retries: u32 },

    /// Inserting the edge would make the dependency graph cyclic.
    #[error("dependency cycle: {task_id} -> {dependency_task_id}")]
    DependencyCycle {
        task_id: TaskId,
        dependency_task_id: TaskId,
    },

    /// The state machine forbids this status edge.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl OrchestratorError {
    pub fn unsupported_task_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedTaskType(msg.into())
    }

    pub fn dispatch_failure(msg: impl Into<String>) -> Self {
        Self::DispatchFailure(msg.into())
    }

    pub fn storage_unavailable(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
