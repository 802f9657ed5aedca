//! `taskgrid-orchestrator`: the orchestration kernel.
//!
//! Wires the domain model to storage and the execution broker: task
//! lifecycle control, dependency resolution, worker load balancing,
//! dispatch with status reconciliation, and analytics.

pub mod analytics;
pub mod balancer;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod lifecycle;
pub mod resolver;

pub use analytics::Analytics;
pub use balancer::{SelectedWorker, WorkerBalancer};
pub use config::OrchestratorConfig;
pub use dispatch::Dispatcher;
pub use health::StoreCircuit;
pub use lifecycle::LifecycleController;
pub use resolver::DependencyResolver;

use taskgrid_core::{OrchestratorError, TaskStatus};
use taskgrid_infra::TaskStoreError;

/// Map a storage error onto the caller-facing taxonomy.
pub(crate) fn store_error(err: TaskStoreError) -> OrchestratorError {
    match err {
        TaskStoreError::NotFound(id) => OrchestratorError::NotFound(id),
        TaskStoreError::AlreadyExists(id) => {
            OrchestratorError::storage_unavailable(format!("duplicate task id {id}"))
        }
        TaskStoreError::Conflict {
            expected, actual, ..
        } => OrchestratorError::InvalidTransition {
            from: actual,
            to: expected,
        },
        TaskStoreError::InvalidTransition { from, to, .. } => {
            OrchestratorError::InvalidTransition { from, to }
        }
        TaskStoreError::Unavailable(msg) => OrchestratorError::StorageUnavailable(msg),
    }
}

/// Like `store_error`, for transition calls where the intended target
/// status is known. A CAS conflict surfaces as the edge the caller tried
/// to take from the status actually found.
pub(crate) fn transition_error(err: TaskStoreError, target: TaskStatus) -> OrchestratorError {
    match err {
        TaskStoreError::Conflict { actual, .. } => OrchestratorError::InvalidTransition {
            from: actual,
            to: target,
        },
        other => store_error(other),
    }
}
