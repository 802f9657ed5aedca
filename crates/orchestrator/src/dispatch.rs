//! Job dispatch and broker status reconciliation.
//!
//! Dispatch translates a task record into a routed broker job. The kernel
//! priority scale (higher = more urgent) is inverted onto the broker scale
//! (0 = most urgent); the soft timeout leaves the worker a 30 second
//! grace window before the hard kill.

use std::collections::HashMap;

use serde_json::json;

use taskgrid_core::{
    OrchestratorError, OrchestratorResult, Task, TaskStatus, TaskTransition, TaskType, WorkerId,
};
use taskgrid_infra::{
    BrokerHandle, BrokerJob, BrokerTaskState, ExecutionBroker, RoutingOptions, TaskStore,
    TaskStoreError,
};

use crate::transition_error;

/// Kernel priority ceiling; broker priority is `10 - priority` clamped
/// into `0..=10`.
const PRIORITY_SCALE: i32 = 10;

/// Grace window between the soft and hard execution deadlines.
const SOFT_TIMEOUT_MARGIN_SECONDS: u64 = 30;

/// How many in-flight tasks one reconciliation sweep examines.
const RECONCILE_BATCH: usize = 256;

fn default_routes() -> HashMap<TaskType, String> {
    HashMap::from([
        (TaskType::Llm, "tasks.llm_inference".to_string()),
        (TaskType::Image, "tasks.image_generation".to_string()),
        (TaskType::Tts, "tasks.tts_synthesis".to_string()),
        (TaskType::ImageToText, "tasks.image_to_text".to_string()),
    ])
}

/// Translates tasks into broker jobs and folds broker state back into
/// task transitions.
pub struct Dispatcher<B> {
    broker: B,
    routes: HashMap<TaskType, String>,
    queue: String,
}

impl<B: ExecutionBroker> Dispatcher<B> {
    pub fn new(broker: B, queue: impl Into<String>) -> Self {
        Self {
            broker,
            routes: default_routes(),
            queue: queue.into(),
        }
    }

    /// Override the route table, for deployments registering a subset of
    /// handlers.
    pub fn with_routes(mut self, routes: HashMap<TaskType, String>) -> Self {
        self.routes = routes;
        self
    }

    /// Registered handler name for a task type.
    pub fn task_name(&self, task_type: TaskType) -> Option<&str> {
        self.routes.get(&task_type).map(String::as_str)
    }

    /// Submit a task for execution, optionally routed to a chosen worker.
    pub async fn dispatch(
        &self,
        task: &Task,
        routing_key: Option<WorkerId>,
    ) -> OrchestratorResult<BrokerHandle> {
        let task_name = self
            .task_name(task.task_type)
            .ok_or_else(|| {
                OrchestratorError::unsupported_task_type(task.task_type.to_string())
            })?
            .to_string();

        let job = BrokerJob {
            task_name,
            payload: json!({
                "task_id": task.id,
                "model": task.model_id,
                "input": task.input.data,
                "parameters": task.input.parameters,
            }),
            routing: RoutingOptions {
                // Kernel priority is unbounded caller input; pin it to the
                // broker scale before inverting.
                priority: (PRIORITY_SCALE - task.priority.clamp(0, PRIORITY_SCALE)) as u8,
                queue: self.queue.clone(),
                routing_key,
                soft_timeout_seconds: task
                    .timeout_seconds
                    .saturating_sub(SOFT_TIMEOUT_MARGIN_SECONDS),
                hard_timeout_seconds: task.timeout_seconds,
            },
        };

        let handle = self
            .broker
            .submit(job)
            .await
            .map_err(|e| OrchestratorError::dispatch_failure(e.to_string()))?;
        tracing::info!(task_id = %task.id, handle = %handle, "task dispatched");
        Ok(handle)
    }

    /// Ask the broker to cancel a job.
    pub async fn revoke(
        &self,
        handle: &BrokerHandle,
        terminate: bool,
    ) -> OrchestratorResult<()> {
        self.broker
            .revoke(handle, terminate)
            .await
            .map_err(|e| OrchestratorError::dispatch_failure(e.to_string()))
    }

    /// Fold the broker's view of one in-flight task back into the store.
    ///
    /// Returns the freshest record available. A CAS conflict means another
    /// writer already advanced the task; the reconciler yields and returns
    /// the winner's version.
    pub async fn reconcile_task<S: TaskStore>(
        &self,
        store: &S,
        task: Task,
    ) -> OrchestratorResult<Task> {
        let Some(handle) = task.broker_handle.clone() else {
            return Ok(task);
        };
        if !matches!(task.status, TaskStatus::Started | TaskStatus::Retry) {
            return Ok(task);
        }

        let handle = BrokerHandle::new(handle);
        let state = match self.broker.task_state(&handle).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "broker state unavailable");
                return Ok(task);
            }
        };
        let Some(transition) = transition_for(&task, &state) else {
            return Ok(task);
        };

        let target = transition.target_status();
        match store
            .transition(
                task.id,
                task.status,
                transition,
                "reconciler",
                Some("broker state sync".to_string()),
            )
            .await
        {
            Ok(updated) => Ok(updated),
            Err(TaskStoreError::Conflict { .. }) => store
                .get(task.id)
                .await
                .map_err(crate::store_error)?
                .ok_or(OrchestratorError::NotFound(task.id)),
            Err(err) => Err(transition_error(err, target)),
        }
    }

    /// One reconciliation sweep over all in-flight tasks.
    pub async fn reconcile_in_flight<S: TaskStore>(&self, store: &S) -> OrchestratorResult<u64> {
        let mut synced = 0;
        for status in [TaskStatus::Started, TaskStatus::Retry] {
            let filter = taskgrid_infra::TaskFilter {
                status: Some(status),
                task_type: None,
            };
            let tasks = store
                .list(filter, RECONCILE_BATCH, 0)
                .await
                .map_err(crate::store_error)?;
            for task in tasks {
                let before = task.status;
                let after = self.reconcile_task(store, task).await?;
                if after.status != before {
                    synced += 1;
                }
            }
        }
        Ok(synced)
    }
}

/// The store transition implied by a broker-reported state, if any.
fn transition_for(task: &Task, state: &BrokerTaskState) -> Option<TaskTransition> {
    match state {
        BrokerTaskState::Pending => None,
        BrokerTaskState::Started => {
            // Only meaningful when the task record still says RETRY.
            (task.status == TaskStatus::Retry).then(|| TaskTransition::Started {
                worker_id: task.worker_id.clone(),
                broker_handle: task.broker_handle.clone().unwrap_or_default(),
            })
        }
        BrokerTaskState::Retry => {
            (task.status != TaskStatus::Retry).then_some(TaskTransition::Retrying)
        }
        BrokerTaskState::Success { result } => Some(TaskTransition::Succeeded {
            output: result.clone(),
        }),
        BrokerTaskState::Failure { error } => Some(TaskTransition::Failed {
            error: error.clone(),
        }),
        BrokerTaskState::Revoked => Some(TaskTransition::Revoked),
    }
}
