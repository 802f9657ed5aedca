//! Task data model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::OrchestratorError;
use crate::id::{TaskId, WorkerId};

/// Kind of inference work a task carries, used for dispatch routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Text generation / LLM inference.
    Llm,
    /// Image generation.
    Image,
    /// Text-to-speech synthesis.
    Tts,
    /// Image captioning / OCR.
    ImageToText,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Llm,
        TaskType::Image,
        TaskType::Tts,
        TaskType::ImageToText,
    ];
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TaskType::Llm => "llm",
            TaskType::Image => "image",
            TaskType::Tts => "tts",
            TaskType::ImageToText => "image_to_text",
        };
        f.write_str(s)
    }
}

/// Task execution status.
///
/// The happy path is `Pending -> Started -> Success`. `Retry` is a transient
/// broker-reported state; `Failure` admits a single outgoing edge back to
/// `Pending` (bounded by the retry budget, enforced by the lifecycle
/// controller). `Success`, `Revoked` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stored, waiting for dispatch or for dependencies.
    Pending,
    /// Submitted to the broker and accepted by a worker.
    Started,
    /// Broker-side retry in progress.
    Retry,
    /// Completed successfully.
    Success,
    /// Completed with an error. Retriable while budget remains.
    Failure,
    /// Cancelled; the broker was asked to terminate the remote execution.
    Revoked,
    /// Deliberately not run. Counts as a satisfied dependency.
    Skipped,
}

impl TaskStatus {
    /// Whether the status admits no further broker-driven progress.
    ///
    /// `Failure` is included: leaving it requires an explicit `retry`, which
    /// is budget-guarded and not a normal state-machine edge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked | TaskStatus::Skipped
        )
    }

    /// Whether a dependency in this status no longer blocks its dependents.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Skipped)
    }

    /// Valid state-machine edges. `Failure -> Pending` is the retry edge;
    /// the retry budget is enforced above this level.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Started | Failure | Revoked | Skipped) => true,
            (Started, Success | Failure | Retry | Revoked) => true,
            (Retry, Pending | Started | Success | Failure | Revoked) => true,
            (Failure, Pending) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Retry => "retry",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Revoked => "revoked",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "started" => Ok(TaskStatus::Started),
            "retry" => Ok(TaskStatus::Retry),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            "revoked" => Ok(TaskStatus::Revoked),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(OrchestratorError::invalid_id(format!(
                "TaskStatus: {other}"
            ))),
        }
    }
}

/// Opaque structured input a task runs inference on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskInput {
    /// Model input (prompt, image reference, ...). Never interpreted by the
    /// kernel.
    pub data: JsonValue,
    /// Model/sampler parameters forwarded to the worker.
    #[serde(default)]
    pub parameters: JsonValue,
}

impl TaskInput {
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            parameters: JsonValue::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Request to create a task, as handed in by the (external) transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub model_id: String,
    pub input: TaskInput,
    /// Higher = more urgent. Defaults to 5.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Hard execution timeout in seconds. Defaults to the configured value.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: JsonMap<String, JsonValue>,
}

impl CreateTaskRequest {
    pub fn new(task_type: TaskType, model_id: impl Into<String>, input: TaskInput) -> Self {
        Self {
            task_type,
            model_id: model_id.into(),
            input,
            priority: None,
            timeout_seconds: None,
            max_retries: None,
            metadata: JsonMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The fixed set of typed mutations a task record admits.
///
/// Replaces open-ended field-map updates: every transition carries exactly
/// the fields it may touch, and the store applies it as one conditional
/// write.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// Dispatch accepted by the broker.
    Started {
        worker_id: Option<WorkerId>,
        broker_handle: String,
    },
    /// Terminal success reported by the broker.
    Succeeded { output: JsonValue },
    /// Failure reported by the broker or by dispatch itself.
    Failed { error: String },
    /// Broker-side retry observed during reconciliation.
    Retrying,
    /// Cancellation applied locally (broker revoke is best-effort).
    Revoked,
    /// Bounded retry: back to `Pending`, budget consumed. An explicit
    /// `max_retries` raises the budget for subsequent attempts.
    RetryRequested { max_retries: Option<u32> },
    /// Deliberately passed over; releases dependents.
    Skipped,
}

impl TaskTransition {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            TaskTransition::Started { .. } => TaskStatus::Started,
            TaskTransition::Succeeded { .. } => TaskStatus::Success,
            TaskTransition::Failed { .. } => TaskStatus::Failure,
            TaskTransition::Retrying => TaskStatus::Retry,
            TaskTransition::Revoked => TaskStatus::Revoked,
            TaskTransition::RetryRequested { .. } => TaskStatus::Pending,
            TaskTransition::Skipped => TaskStatus::Skipped,
        }
    }
}

/// A tracked unit of inference work.
///
/// Owned exclusively by the lifecycle controller; mutated only through
/// `TaskTransition`s applied by the store. Satellite rows (dependencies,
/// metrics, execution logs, status history, worker assignments) are keyed by
/// `id` and outlive status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i32,
    pub model_id: String,
    pub worker_id: Option<WorkerId>,
    pub input: TaskInput,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    /// Opaque broker task reference, present once dispatch succeeded. Used
    /// by status reconciliation.
    pub broker_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: JsonMap<String, JsonValue>,
}

impl Task {
    /// Materialize a PENDING record from a create request.
    pub fn from_request(
        request: CreateTaskRequest,
        default_timeout_seconds: u64,
        default_max_retries: u32,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: request.task_type,
            status: TaskStatus::Pending,
            priority: request.priority.unwrap_or(5),
            model_id: request.model_id,
            worker_id: None,
            input: request.input,
            output: None,
            error: None,
            broker_handle: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: request.timeout_seconds.unwrap_or(default_timeout_seconds),
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            metadata: request.metadata,
        }
    }

    /// Apply a typed transition, stamping timestamps and payload fields.
    ///
    /// Returns the state-machine error when the edge is invalid. Status is
    /// the only field callers may race on; stores wrap this in a
    /// compare-and-swap keyed on the previously-observed status.
    pub fn apply(
        &mut self,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let to = transition.target_status();
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        match transition {
            TaskTransition::Started {
                worker_id,
                broker_handle,
            } => {
                self.worker_id = worker_id.clone();
                self.broker_handle = Some(broker_handle.clone());
                self.started_at = Some(now);
            }
            TaskTransition::Succeeded { output } => {
                self.output = Some(output.clone());
                self.completed_at = Some(now);
            }
            TaskTransition::Failed { error } => {
                self.error = Some(error.clone());
                self.completed_at = Some(now);
            }
            TaskTransition::Retrying => {}
            TaskTransition::Revoked | TaskTransition::Skipped => {
                self.completed_at = Some(now);
            }
            TaskTransition::RetryRequested { max_retries } => {
                if let Some(max_retries) = max_retries {
                    self.max_retries = *max_retries;
                }
                self.retry_count += 1;
                self.started_at = None;
                self.completed_at = None;
                self.error = None;
                self.output = None;
                self.broker_handle = None;
            }
        }

        self.status = to;
        Ok(())
    }

    /// Remaining permitted retry attempts.
    pub fn retry_budget(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Wall-clock duration from creation to completion, when completed.
    pub fn duration_seconds(&self) -> Option<f64> {
        let completed = self.completed_at?;
        let millis = (completed - self.created_at).num_milliseconds();
        Some(millis.max(0) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn test_request() -> CreateTaskRequest {
        CreateTaskRequest::new(
            TaskType::Llm,
            "m1",
            TaskInput::new(json!({"prompt": "hi"})),
        )
    }

    #[test]
    fn from_request_applies_defaults() {
        let task = Task::from_request(test_request(), 300, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.timeout_seconds, 300);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert!(task.worker_id.is_none());
        assert!(task.broker_handle.is_none());
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut task = Task::from_request(test_request(), 300, 3);
        let now = Utc::now();

        task.apply(
            &TaskTransition::Started {
                worker_id: Some(WorkerId::new("w1")),
                broker_handle: "handle-1".into(),
            },
            now,
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert!(task.created_at <= task.started_at.unwrap());

        task.apply(&TaskTransition::Succeeded { output: json!({"text": "ok"}) }, Utc::now())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.completed_at.is_some());
        assert_eq!(task.output, Some(json!({"text": "ok"})));
    }

    #[test]
    fn retry_resets_execution_fields_and_consumes_budget() {
        let mut task = Task::from_request(test_request(), 300, 3);
        task.apply(
            &TaskTransition::Started {
                worker_id: None,
                broker_handle: "h".into(),
            },
            Utc::now(),
        )
        .unwrap();
        task.apply(&TaskTransition::Failed { error: "boom".into() }, Utc::now())
            .unwrap();

        task.apply(&TaskTransition::RetryRequested { max_retries: None }, Utc::now())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.retry_budget(), 2);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.error.is_none());
        assert!(task.broker_handle.is_none());
    }

    #[test]
    fn retry_override_raises_the_budget() {
        let mut task = Task::from_request(test_request(), 300, 1);
        task.apply(
            &TaskTransition::Started {
                worker_id: None,
                broker_handle: "h".into(),
            },
            Utc::now(),
        )
        .unwrap();
        task.apply(&TaskTransition::Failed { error: "boom".into() }, Utc::now())
            .unwrap();

        task.apply(
            &TaskTransition::RetryRequested { max_retries: Some(3) },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_budget(), 2);
    }

    #[test]
    fn success_admits_no_further_transitions() {
        let mut task = Task::from_request(test_request(), 300, 3);
        task.apply(
            &TaskTransition::Started {
                worker_id: None,
                broker_handle: "h".into(),
            },
            Utc::now(),
        )
        .unwrap();
        task.apply(&TaskTransition::Succeeded { output: JsonValue::Null }, Utc::now())
            .unwrap();

        let err = task
            .apply(&TaskTransition::Revoked, Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[test]
    fn skipped_counts_as_satisfied_dependency() {
        assert!(TaskStatus::Success.satisfies_dependency());
        assert!(TaskStatus::Skipped.satisfies_dependency());
        assert!(!TaskStatus::Failure.satisfies_dependency());
        assert!(!TaskStatus::Started.satisfies_dependency());
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::Started),
            Just(TaskStatus::Retry),
            Just(TaskStatus::Success),
            Just(TaskStatus::Failure),
            Just(TaskStatus::Revoked),
            Just(TaskStatus::Skipped),
        ]
    }

    proptest! {
        /// Property: no edge leaves a terminal state, except the bounded
        /// retry edge `Failure -> Pending`.
        #[test]
        fn terminal_states_admit_no_edges(from in any_status(), to in any_status()) {
            if from.is_terminal() && from.can_transition_to(to) {
                prop_assert_eq!(from, TaskStatus::Failure);
                prop_assert_eq!(to, TaskStatus::Pending);
            }
        }

        /// Property: every reachable edge targets the status the transition
        /// declares.
        #[test]
        fn edges_are_closed_under_declared_targets(from in any_status(), to in any_status()) {
            if from.can_transition_to(to) {
                prop_assert!(!matches!(to, TaskStatus::Pending) || matches!(from, TaskStatus::Retry | TaskStatus::Failure));
            }
        }
    }
}
