//! `taskgrid-core`: domain foundation for the orchestration kernel.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the task data model and its status state machine, and the
//! kernel error taxonomy.

pub mod error;
pub mod id;
pub mod task;

pub use error::{OrchestratorError, OrchestratorResult};
pub use id::{TaskId, WorkerId};
pub use task::{
    CreateTaskRequest, Task, TaskInput, TaskStatus, TaskTransition, TaskType,
};
