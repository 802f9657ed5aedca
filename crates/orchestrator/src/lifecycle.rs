//! Task lifecycle control.
//!
//! The controller is the single write path for task records. Creation
//! immediately dispatches dependency-free tasks, so a create call always
//! lands the task in STARTED or FAILURE; tasks created with dependencies
//! stay PENDING until the sweep releases them. Cancellation and retry are
//! compare-and-swap transitions, so a racing reconciler cannot be
//! overwritten silently.

use std::sync::Arc;
use std::time::Duration;

use taskgrid_core::{
    CreateTaskRequest, OrchestratorError, OrchestratorResult, Task, TaskId, TaskStatus,
    TaskTransition,
};
use taskgrid_infra::{
    ExecutionBroker, ExecutionLogEntry, LogLevel, TaskFilter, TaskStore, TaskStoreError,
    WorkerAssignment,
};

use crate::balancer::WorkerBalancer;
use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::health::StoreCircuit;
use crate::resolver::DependencyResolver;
use crate::{store_error, transition_error};

/// Audit actor name for controller-driven transitions.
const ACTOR: &str = "lifecycle";

/// How many released tasks one sweep may dispatch.
const DISPATCH_BATCH: usize = 64;

/// Coordinates store, balancer and broker for the full task lifecycle.
pub struct LifecycleController<S, B> {
    store: S,
    dispatcher: Dispatcher<B>,
    balancer: WorkerBalancer<B>,
    resolver: DependencyResolver<S>,
    circuit: StoreCircuit,
    config: OrchestratorConfig,
}

impl<S, B> LifecycleController<S, B>
where
    S: TaskStore + Clone,
    B: ExecutionBroker + Clone,
{
    pub fn new(store: S, broker: B, config: OrchestratorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(broker.clone(), config.dispatch_queue.clone()),
            balancer: WorkerBalancer::new(broker),
            resolver: DependencyResolver::new(store.clone()),
            circuit: StoreCircuit::default(),
            store,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<B> {
        &self.dispatcher
    }

    pub fn balancer(&self) -> &WorkerBalancer<B> {
        &self.balancer
    }

    pub fn resolver(&self) -> &DependencyResolver<S> {
        &self.resolver
    }

    /// Create a dependency-free task and dispatch it right away.
    ///
    /// The returned record is never PENDING: dispatch either succeeded
    /// (STARTED) or its error was absorbed into a FAILURE record.
    pub async fn create_task(&self, request: CreateTaskRequest) -> OrchestratorResult<Task> {
        self.create_task_with_dependencies(request, &[]).await
    }

    /// Create a task that waits for `depends_on` before dispatch.
    ///
    /// Edges are cycle-checked; on rejection the freshly created record is
    /// removed again. With no (or only satisfied) dependencies the task is
    /// dispatched immediately.
    pub async fn create_task_with_dependencies(
        &self,
        request: CreateTaskRequest,
        depends_on: &[TaskId],
    ) -> OrchestratorResult<Task> {
        self.dispatcher
            .task_name(request.task_type)
            .ok_or_else(|| {
                OrchestratorError::unsupported_task_type(request.task_type.to_string())
            })?;
        self.check_circuit()?;

        let task = Task::from_request(
            request,
            self.config.default_timeout_seconds,
            self.config.default_max_retries,
        );
        let id = self.note(self.store.create(task.clone()).await)?;
        tracing::info!(task_id = %id, task_type = %task.task_type, "task created");
        self.log_event(id, LogLevel::Info, "task created", Some("create"))
            .await;

        for dep in depends_on {
            if let Err(err) = self.resolver.add_dependency(id, *dep, "completion").await {
                let _ = self.store.delete(id).await;
                return Err(err);
            }
        }
        if !depends_on.is_empty() && !self.resolver.is_released(id).await? {
            return Ok(task);
        }

        self.start(task).await
    }

    /// Fetch a task, folding in the broker's current view first.
    pub async fn get_task(&self, id: TaskId) -> OrchestratorResult<Task> {
        self.check_circuit()?;
        let task = self
            .note(self.store.get(id).await)?
            .ok_or(OrchestratorError::NotFound(id))?;
        self.dispatcher.reconcile_task(&self.store, task).await
    }

    pub async fn list_tasks(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> OrchestratorResult<Vec<Task>> {
        self.check_circuit()?;
        self.note(self.store.list(filter, limit, offset).await)
    }

    /// Apply an audited transition to a task.
    pub async fn update_status(
        &self,
        id: TaskId,
        transition: TaskTransition,
        changed_by: &str,
        reason: Option<String>,
    ) -> OrchestratorResult<Task> {
        self.check_circuit()?;
        let task = self
            .note(self.store.get(id).await)?
            .ok_or(OrchestratorError::NotFound(id))?;
        let target = transition.target_status();
        self.store
            .transition(id, task.status, transition, changed_by, reason)
            .await
            .map_err(|e| transition_error(e, target))
    }

    /// Cancel a task. Returns `Ok(false)` when it already reached a
    /// terminal status; cancellation of finished work is not an error.
    pub async fn cancel_task(
        &self,
        id: TaskId,
        reason: Option<String>,
        actor: &str,
    ) -> OrchestratorResult<bool> {
        self.check_circuit()?;
        let mut task = self
            .note(self.store.get(id).await)?
            .ok_or(OrchestratorError::NotFound(id))?;
        let reason = reason.unwrap_or_else(|| "cancelled by user".to_string());

        for attempt in 0..2 {
            if task.status.is_terminal() {
                return Ok(false);
            }

            // Remote revoke is best-effort: the local record is
            // authoritative even when the broker cannot be reached.
            if let Some(handle) = &task.broker_handle {
                if let Err(err) = self
                    .dispatcher
                    .revoke(&taskgrid_infra::BrokerHandle::new(handle.clone()), true)
                    .await
                {
                    tracing::warn!(task_id = %id, error = %err, "broker revoke failed");
                }
            }

            match self
                .store
                .transition(
                    id,
                    task.status,
                    TaskTransition::Revoked,
                    actor,
                    Some(reason.clone()),
                )
                .await
            {
                Ok(_) => {
                    self.log_event(id, LogLevel::Warning, "task cancelled", Some("cancel"))
                        .await;
                    return Ok(true);
                }
                Err(TaskStoreError::Conflict { .. }) if attempt == 0 => {
                    // Another writer moved the task first; re-read and
                    // decide again.
                    task = self
                        .note(self.store.get(id).await)?
                        .ok_or(OrchestratorError::NotFound(id))?;
                }
                Err(err) => return Err(transition_error(err, TaskStatus::Revoked)),
            }
        }
        Ok(false)
    }

    /// Re-run a failed task, consuming one unit of retry budget. An
    /// explicit `max_retries` raises the budget before the check.
    pub async fn retry_task(
        &self,
        id: TaskId,
        max_retries: Option<u32>,
    ) -> OrchestratorResult<Task> {
        self.check_circuit()?;
        let task = self
            .note(self.store.get(id).await)?
            .ok_or(OrchestratorError::NotFound(id))?;

        if task.status != TaskStatus::Failure {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        let budget = max_retries.unwrap_or(task.max_retries);
        if task.retry_count >= budget {
            return Err(OrchestratorError::RetriesExhausted {
                task_id: id,
                max_retries: budget,
            });
        }

        let attempt = task.retry_count + 1;
        let reset = self
            .store
            .transition(
                id,
                TaskStatus::Failure,
                TaskTransition::RetryRequested { max_retries },
                ACTOR,
                Some(format!("Retry attempt {attempt}")),
            )
            .await
            .map_err(|e| transition_error(e, TaskStatus::Pending))?;
        self.log_event(
            id,
            LogLevel::Info,
            format!("retry attempt {attempt}"),
            Some("retry"),
        )
        .await;

        self.start(reset).await
    }

    /// Unconditional hard delete, cascading all satellite rows. Returns
    /// `false` when the task did not exist.
    pub async fn delete_task(&self, id: TaskId) -> OrchestratorResult<bool> {
        self.check_circuit()?;
        self.note(self.store.delete(id).await)
    }

    /// Whether the storage circuit is currently open.
    pub fn is_degraded(&self) -> bool {
        self.circuit.is_open()
    }

    /// One background sweep: sync in-flight tasks with the broker, then
    /// dispatch every task the sync released.
    pub async fn run_sweep(&self) -> OrchestratorResult<(u64, u64)> {
        let synced = self.dispatcher.reconcile_in_flight(&self.store).await?;

        let mut dispatched = 0;
        for task in self.resolver.ready_tasks(DISPATCH_BATCH).await? {
            let task_id = task.id;
            match self.start(task).await {
                Ok(started) if started.status == TaskStatus::Started => dispatched += 1,
                Ok(_) => {}
                // One stuck task must not starve the rest of the batch;
                // the next sweep picks it up again.
                Err(err) => {
                    tracing::warn!(task_id = %task_id, error = %err, "sweep dispatch failed");
                }
            }
        }
        Ok((synced, dispatched))
    }

    /// Periodic `run_sweep` loop.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        S: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match controller.run_sweep().await {
                    Ok((synced, dispatched)) if synced > 0 || dispatched > 0 => {
                        tracing::debug!(synced, dispatched, "sweep applied updates");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "sweep failed");
                    }
                }
            }
        })
    }

    /// Pick a worker and dispatch a PENDING task.
    ///
    /// Dispatch failure is absorbed: the record moves to FAILURE with the
    /// error captured, and the FAILURE record is returned.
    async fn start(&self, task: Task) -> OrchestratorResult<Task> {
        let selected = self
            .balancer
            .select_worker(task.task_type)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(task_id = %task.id, error = %err, "worker stats unavailable");
                None
            });

        if let Some(selected) = &selected {
            let assignment = WorkerAssignment {
                worker_id: selected.worker_id.clone(),
                task_id: task.id,
                assignment_score: selected.score,
                estimated_completion: None,
                assigned_at: chrono::Utc::now(),
            };
            if let Err(err) = self.store.record_assignment(assignment).await {
                tracing::warn!(task_id = %task.id, error = %err, "assignment not recorded");
            }
        }

        let routing_key = selected.map(|s| s.worker_id);
        match self.dispatcher.dispatch(&task, routing_key.clone()).await {
            Ok(handle) => {
                let started = self
                    .store
                    .transition(
                        task.id,
                        task.status,
                        TaskTransition::Started {
                            worker_id: routing_key,
                            broker_handle: handle.to_string(),
                        },
                        ACTOR,
                        None,
                    )
                    .await
                    .map_err(|e| transition_error(e, TaskStatus::Started))?;
                self.log_event(task.id, LogLevel::Info, "dispatched to broker", Some("dispatch"))
                    .await;
                Ok(started)
            }
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "dispatch failed");
                let failed = self
                    .store
                    .transition(
                        task.id,
                        task.status,
                        TaskTransition::Failed {
                            error: err.to_string(),
                        },
                        ACTOR,
                        Some("dispatch failed".to_string()),
                    )
                    .await
                    .map_err(|e| transition_error(e, TaskStatus::Failure))?;
                self.log_event(task.id, LogLevel::Error, err.to_string(), Some("dispatch"))
                    .await;
                Ok(failed)
            }
        }
    }

    fn check_circuit(&self) -> OrchestratorResult<()> {
        if self.circuit.is_open() {
            return Err(OrchestratorError::storage_unavailable(
                "task store circuit open",
            ));
        }
        Ok(())
    }

    /// Track store health: only infrastructure failures count against the
    /// circuit.
    fn note<T>(&self, result: Result<T, TaskStoreError>) -> OrchestratorResult<T> {
        match result {
            Ok(value) => {
                self.circuit.record_success();
                Ok(value)
            }
            Err(err) => {
                if matches!(err, TaskStoreError::Unavailable(_)) {
                    self.circuit.record_failure();
                }
                Err(store_error(err))
            }
        }
    }

    /// Best-effort audit line; failures are logged, never surfaced.
    async fn log_event(
        &self,
        task_id: TaskId,
        level: LogLevel,
        message: impl Into<String>,
        step: Option<&str>,
    ) {
        let mut entry = ExecutionLogEntry::new(task_id, level, message);
        if let Some(step) = step {
            entry = entry.with_step(step);
        }
        if let Err(err) = self.store.record_execution_log(entry).await {
            tracing::warn!(task_id = %task_id, error = %err, "execution log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use taskgrid_core::{TaskInput, TaskType, WorkerId};
    use taskgrid_infra::{
        AnalyticsSummary, BrokerHandle, Dependency, DependencyView, InMemoryTaskStore,
        InProcessBroker, Metric, StatusHistoryEntry, WorkerPerformance, WorkerStats,
    };

    use super::*;

    fn controller() -> (
        Arc<InMemoryTaskStore>,
        Arc<InProcessBroker>,
        LifecycleController<Arc<InMemoryTaskStore>, Arc<InProcessBroker>>,
    ) {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InProcessBroker::new());
        broker.set_workers(vec![
            WorkerStats::new("w-a").with_load(2, 0, 0),
            WorkerStats::new("w-b"),
            WorkerStats::new("w-c").with_load(1, 0, 0),
        ]);
        let controller = LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            OrchestratorConfig::default(),
        );
        (store, broker, controller)
    }

    fn request() -> CreateTaskRequest {
        CreateTaskRequest::new(
            TaskType::Llm,
            "llama-3-8b",
            TaskInput::new(json!({"prompt": "hello"})),
        )
    }

    fn handle_of(task: &Task) -> BrokerHandle {
        BrokerHandle::new(task.broker_handle.clone().unwrap())
    }

    /// Store double whose `transition` always fails for one task id.
    #[derive(Clone)]
    struct FaultyTransitions {
        inner: Arc<InMemoryTaskStore>,
        poisoned: TaskId,
    }

    #[async_trait::async_trait]
    impl TaskStore for FaultyTransitions {
        async fn create(&self, task: Task) -> Result<TaskId, TaskStoreError> {
            self.inner.create(task).await
        }

        async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
            self.inner.get(id).await
        }

        async fn list(
            &self,
            filter: TaskFilter,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Task>, TaskStoreError> {
            self.inner.list(filter, limit, offset).await
        }

        async fn transition(
            &self,
            id: TaskId,
            expected: TaskStatus,
            transition: TaskTransition,
            changed_by: &str,
            reason: Option<String>,
        ) -> Result<Task, TaskStoreError> {
            if id == self.poisoned {
                return Err(TaskStoreError::Unavailable(
                    "transition rejected".to_string(),
                ));
            }
            self.inner
                .transition(id, expected, transition, changed_by, reason)
                .await
        }

        async fn delete(&self, id: TaskId) -> Result<bool, TaskStoreError> {
            self.inner.delete(id).await
        }

        async fn add_dependency(
            &self,
            task_id: TaskId,
            dependency_task_id: TaskId,
            dependency_type: &str,
        ) -> Result<(), TaskStoreError> {
            self.inner
                .add_dependency(task_id, dependency_task_id, dependency_type)
                .await
        }

        async fn dependency_edges(
            &self,
            task_id: TaskId,
        ) -> Result<Vec<Dependency>, TaskStoreError> {
            self.inner.dependency_edges(task_id).await
        }

        async fn list_dependencies(
            &self,
            task_id: TaskId,
        ) -> Result<Vec<DependencyView>, TaskStoreError> {
            self.inner.list_dependencies(task_id).await
        }

        async fn ready_tasks(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
            self.inner.ready_tasks(limit).await
        }

        async fn record_assignment(
            &self,
            assignment: WorkerAssignment,
        ) -> Result<(), TaskStoreError> {
            self.inner.record_assignment(assignment).await
        }

        async fn assignments(
            &self,
            worker_id: Option<&WorkerId>,
            active_only: bool,
        ) -> Result<Vec<WorkerAssignment>, TaskStoreError> {
            self.inner.assignments(worker_id, active_only).await
        }

        async fn record_metric(&self, metric: Metric) -> Result<(), TaskStoreError> {
            self.inner.record_metric(metric).await
        }

        async fn metrics_of(&self, task_id: TaskId) -> Result<Vec<Metric>, TaskStoreError> {
            self.inner.metrics_of(task_id).await
        }

        async fn metrics_by_name(
            &self,
            name: &str,
            limit: usize,
        ) -> Result<Vec<Metric>, TaskStoreError> {
            self.inner.metrics_by_name(name, limit).await
        }

        async fn record_execution_log(
            &self,
            entry: ExecutionLogEntry,
        ) -> Result<(), TaskStoreError> {
            self.inner.record_execution_log(entry).await
        }

        async fn execution_logs(
            &self,
            task_id: TaskId,
            limit: usize,
        ) -> Result<Vec<ExecutionLogEntry>, TaskStoreError> {
            self.inner.execution_logs(task_id, limit).await
        }

        async fn status_history(
            &self,
            task_id: TaskId,
        ) -> Result<Vec<StatusHistoryEntry>, TaskStoreError> {
            self.inner.status_history(task_id).await
        }

        async fn summary(&self, window_hours: u32) -> Result<AnalyticsSummary, TaskStoreError> {
            self.inner.summary(window_hours).await
        }

        async fn worker_performance(
            &self,
            worker_id: &WorkerId,
            window_hours: u32,
        ) -> Result<WorkerPerformance, TaskStoreError> {
            self.inner.worker_performance(worker_id, window_hours).await
        }
    }

    #[tokio::test]
    async fn create_dispatches_to_least_loaded_worker() {
        let (store, broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert_eq!(task.worker_id, Some(WorkerId::new("w-b")));
        assert!(task.broker_handle.is_some());

        let jobs = broker.submitted();
        assert_eq!(jobs[0].routing.routing_key, Some(WorkerId::new("w-b")));

        let assignments = store.assignments(None, true).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].task_id, task.id);
    }

    #[tokio::test]
    async fn create_never_returns_a_pending_task() {
        let (_store, broker, controller) = controller();
        broker.fail_submissions("broker down");

        let task = controller.create_task(request()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.error.as_deref().unwrap().contains("broker down"));
    }

    #[tokio::test]
    async fn get_task_folds_in_broker_state() {
        let (_store, broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        broker.complete(&handle_of(&task), json!({"text": "done"}));

        let fetched = controller.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Success);
        assert_eq!(fetched.output, Some(json!({"text": "done"})));
    }

    #[tokio::test]
    async fn cancel_revokes_in_flight_work() {
        let (store, broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        assert!(controller.cancel_task(task.id, None, "user").await.unwrap());

        let cancelled = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Revoked);
        assert!(matches!(
            broker.task_state(&handle_of(&task)).await.unwrap(),
            taskgrid_infra::BrokerTaskState::Revoked
        ));

        let history = store.status_history(task.id).await.unwrap();
        assert_eq!(history[0].reason.as_deref(), Some("cancelled by user"));
    }

    #[tokio::test]
    async fn cancel_of_finished_work_is_a_no_op() {
        let (_store, broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        broker.complete(&handle_of(&task), json!(null));
        controller.get_task(task.id).await.unwrap();

        assert!(!controller.cancel_task(task.id, None, "user").await.unwrap());
    }

    #[tokio::test]
    async fn retry_consumes_budget_and_redispatches() {
        let (store, broker, controller) = controller();
        broker.fail_submissions("broker down");

        let task = controller.create_task(request()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failure);

        broker.accept_submissions();
        let retried = controller.retry_task(task.id, None).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Started);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());

        let history = store.status_history(task.id).await.unwrap();
        assert!(history
            .iter()
            .any(|h| h.reason.as_deref() == Some("Retry attempt 1")));
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_after_max_retries_attempts() {
        let (_store, broker, controller) = controller();
        broker.fail_submissions("broker down");

        let task = controller
            .create_task(request().with_max_retries(2))
            .await
            .unwrap();
        for _ in 0..2 {
            let failed = controller.retry_task(task.id, None).await.unwrap();
            assert_eq!(failed.status, TaskStatus::Failure);
        }

        let err = controller.retry_task(task.id, None).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::RetriesExhausted {
                task_id: task.id,
                max_retries: 2,
            }
        );
    }

    #[tokio::test]
    async fn retry_of_a_running_task_is_rejected() {
        let (_store, _broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        let err = controller.retry_task(task.id, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn dependent_task_waits_for_its_dependency() {
        let (store, broker, controller) = controller();

        let dep = controller.create_task(request()).await.unwrap();
        let dependent = controller
            .create_task_with_dependencies(request(), &[dep.id])
            .await
            .unwrap();
        assert_eq!(dependent.status, TaskStatus::Pending);

        // Sweep before the dependency finished: nothing to dispatch.
        let (_, dispatched) = controller.run_sweep().await.unwrap();
        assert_eq!(dispatched, 0);

        broker.complete(&handle_of(&dep), json!(null));
        let (synced, dispatched) = controller.run_sweep().await.unwrap();
        assert_eq!(synced, 1);
        assert_eq!(dispatched, 1);

        let released = store.get(dependent.id).await.unwrap().unwrap();
        assert_eq!(released.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn sweep_keeps_dispatching_past_a_failing_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InProcessBroker::new());
        broker.set_workers(vec![WorkerStats::new("w-a")]);

        let poisoned = store
            .create(Task::from_request(request().with_priority(9), 300, 3))
            .await
            .unwrap();
        let healthy = store
            .create(Task::from_request(request().with_priority(1), 300, 3))
            .await
            .unwrap();

        let controller = LifecycleController::new(
            FaultyTransitions {
                inner: Arc::clone(&store),
                poisoned,
            },
            Arc::clone(&broker),
            OrchestratorConfig::default(),
        );

        // The failing task sorts first; the one queued behind it still
        // goes out.
        let (_, dispatched) = controller.run_sweep().await.unwrap();
        assert_eq!(dispatched, 1);

        let stuck = store.get(poisoned).await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Pending);
        let started = store.get(healthy).await.unwrap().unwrap();
        assert_eq!(started.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn rejected_dependency_edge_rolls_back_the_new_task() {
        let (store, _broker, controller) = controller();

        let before = store.list(TaskFilter::default(), 100, 0).await.unwrap().len();
        let err = controller
            .create_task_with_dependencies(request(), &[TaskId::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let after = store.list(TaskFilter::default(), 100, 0).await.unwrap().len();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn delete_is_unconditional() {
        let (store, _broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        assert!(controller.delete_task(task.id).await.unwrap());
        assert!(!controller.delete_task(task.id).await.unwrap());
        assert!(store.status_history(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_writes_an_audited_row() {
        let (store, _broker, controller) = controller();

        let task = controller.create_task(request()).await.unwrap();
        let updated = controller
            .update_status(
                task.id,
                TaskTransition::Succeeded { output: json!("ok") },
                "worker-callback",
                Some("reported done".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Success);

        let history = store.status_history(task.id).await.unwrap();
        assert_eq!(history[0].changed_by, "worker-callback");
        assert_eq!(history[0].reason.as_deref(), Some("reported done"));
    }

    #[tokio::test]
    async fn retry_override_extends_an_exhausted_budget() {
        let (_store, broker, controller) = controller();
        broker.fail_submissions("broker down");

        let task = controller
            .create_task(request().with_max_retries(0))
            .await
            .unwrap();
        assert!(matches!(
            controller.retry_task(task.id, None).await.unwrap_err(),
            OrchestratorError::RetriesExhausted { .. }
        ));

        broker.accept_submissions();
        let retried = controller.retry_task(task.id, Some(2)).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Started);
        assert_eq!(retried.max_retries, 2);
    }
}
