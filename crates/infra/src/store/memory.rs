//! In-memory `TaskStore`, used by tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::RwLock;

use taskgrid_core::{Task, TaskId, TaskStatus, TaskTransition, WorkerId};

use super::{
    AnalyticsSummary, Dependency, DependencyView, ExecutionLogEntry, HourlyBucket, Metric,
    StatusHistoryEntry, TaskFilter, TaskStore, TaskStoreError, WorkerAssignment,
    WorkerPerformance,
};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    dependencies: Vec<Dependency>,
    assignments: Vec<WorkerAssignment>,
    metrics: Vec<Metric>,
    execution_logs: Vec<ExecutionLogEntry>,
    status_history: Vec<StatusHistoryEntry>,
}

/// `TaskStore` backed by process memory behind a single `RwLock`.
///
/// Mirrors the Postgres implementation's semantics, including the
/// compare-and-swap on `transition` and cascading deletes.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        state.tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let state = self.state.read().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.task_type.is_none_or(|tt| t.task_type == tt))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<Task, TaskStoreError> {
        let mut state = self.state.write().await;
        let current = state
            .tasks
            .get(&id)
            .ok_or(TaskStoreError::NotFound(id))?;
        if current.status != expected {
            return Err(TaskStoreError::Conflict {
                task_id: id,
                expected,
                actual: current.status,
            });
        }

        let now = Utc::now();
        let mut updated = current.clone();
        updated
            .apply(&transition, now)
            .map_err(|_| TaskStoreError::InvalidTransition {
                task_id: id,
                from: expected,
                to: transition.target_status(),
            })?;

        state.status_history.push(StatusHistoryEntry {
            task_id: id,
            old_status: Some(expected),
            new_status: updated.status,
            changed_by: changed_by.to_string(),
            reason,
            changed_at: now,
        });
        state.tasks.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        let mut state = self.state.write().await;
        if state.tasks.remove(&id).is_none() {
            return Ok(false);
        }
        state
            .dependencies
            .retain(|d| d.task_id != id && d.dependency_task_id != id);
        state.assignments.retain(|a| a.task_id != id);
        state.metrics.retain(|m| m.task_id != id);
        state.execution_logs.retain(|l| l.task_id != id);
        state.status_history.retain(|h| h.task_id != id);
        Ok(true)
    }

    async fn add_dependency(
        &self,
        task_id: TaskId,
        dependency_task_id: TaskId,
        dependency_type: &str,
    ) -> Result<(), TaskStoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&task_id) {
            return Err(TaskStoreError::NotFound(task_id));
        }
        if !state.tasks.contains_key(&dependency_task_id) {
            return Err(TaskStoreError::NotFound(dependency_task_id));
        }
        let exists = state
            .dependencies
            .iter()
            .any(|d| d.task_id == task_id && d.dependency_task_id == dependency_task_id);
        if !exists {
            state.dependencies.push(Dependency {
                task_id,
                dependency_task_id,
                dependency_type: dependency_type.to_string(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn dependency_edges(&self, task_id: TaskId) -> Result<Vec<Dependency>, TaskStoreError> {
        let state = self.state.read().await;
        Ok(state
            .dependencies
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_dependencies(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DependencyView>, TaskStoreError> {
        let state = self.state.read().await;
        let mut views: Vec<DependencyView> = state
            .dependencies
            .iter()
            .filter(|d| d.task_id == task_id)
            .filter_map(|d| {
                let dep = state.tasks.get(&d.dependency_task_id)?;
                Some(DependencyView {
                    dependency_task_id: d.dependency_task_id,
                    dependency_type: d.dependency_type.clone(),
                    dependency_status: dep.status,
                    dependency_task_type: dep.task_type,
                    created_at: d.created_at,
                })
            })
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(views)
    }

    async fn ready_tasks(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let state = self.state.read().await;
        let mut ready: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                state
                    .dependencies
                    .iter()
                    .filter(|d| d.task_id == t.id)
                    .all(|d| {
                        state
                            .tasks
                            .get(&d.dependency_task_id)
                            .is_some_and(|dep| dep.status.satisfies_dependency())
                    })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn record_assignment(
        &self,
        assignment: WorkerAssignment,
    ) -> Result<(), TaskStoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&assignment.task_id) {
            return Err(TaskStoreError::NotFound(assignment.task_id));
        }
        if let Some(task) = state.tasks.get_mut(&assignment.task_id) {
            task.worker_id = Some(assignment.worker_id.clone());
        }
        state.assignments.push(assignment);
        Ok(())
    }

    async fn assignments(
        &self,
        worker_id: Option<&WorkerId>,
        active_only: bool,
    ) -> Result<Vec<WorkerAssignment>, TaskStoreError> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .iter()
            .filter(|a| worker_id.is_none_or(|w| &a.worker_id == w))
            .filter(|a| {
                !active_only
                    || state
                        .tasks
                        .get(&a.task_id)
                        .is_some_and(|t| !t.status.is_terminal())
            })
            .cloned()
            .collect())
    }

    async fn record_metric(&self, metric: Metric) -> Result<(), TaskStoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&metric.task_id) {
            return Err(TaskStoreError::NotFound(metric.task_id));
        }
        state.metrics.push(metric);
        Ok(())
    }

    async fn metrics_of(&self, task_id: TaskId) -> Result<Vec<Metric>, TaskStoreError> {
        let state = self.state.read().await;
        Ok(state
            .metrics
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn metrics_by_name(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Metric>, TaskStoreError> {
        let state = self.state.read().await;
        let mut metrics: Vec<Metric> = state
            .metrics
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        metrics.truncate(limit);
        Ok(metrics)
    }

    async fn record_execution_log(
        &self,
        entry: ExecutionLogEntry,
    ) -> Result<(), TaskStoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&entry.task_id) {
            return Err(TaskStoreError::NotFound(entry.task_id));
        }
        state.execution_logs.push(entry);
        Ok(())
    }

    async fn execution_logs(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, TaskStoreError> {
        let state = self.state.read().await;
        let mut logs: Vec<ExecutionLogEntry> = state
            .execution_logs
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn status_history(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<StatusHistoryEntry>, TaskStoreError> {
        let state = self.state.read().await;
        // Entries are appended in transition order; newest first.
        let history: Vec<StatusHistoryEntry> = state
            .status_history
            .iter()
            .rev()
            .filter(|h| h.task_id == task_id)
            .cloned()
            .collect();
        Ok(history)
    }

    async fn summary(&self, window_hours: u32) -> Result<AnalyticsSummary, TaskStoreError> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let window: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.created_at >= cutoff)
            .collect();

        let mut status_counts: BTreeMap<String, u64> = BTreeMap::new();
        for task in &window {
            *status_counts.entry(task.status.to_string()).or_insert(0) += 1;
        }

        let durations: Vec<f64> = window
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .filter_map(|t| t.duration_seconds())
            .collect();

        let active_workers = window
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Started | TaskStatus::Retry))
            .filter_map(|t| t.worker_id.as_ref())
            .collect::<HashSet<_>>()
            .len() as u64;

        let mut buckets: BTreeMap<DateTime<Utc>, HourlyBucket> = BTreeMap::new();
        for task in &window {
            let hour = truncate_to_hour(task.created_at);
            let bucket = buckets.entry(hour).or_insert_with(|| HourlyBucket {
                hour,
                total: 0,
                succeeded: 0,
                failed: 0,
            });
            bucket.total += 1;
            match task.status {
                TaskStatus::Success => bucket.succeeded += 1,
                TaskStatus::Failure => bucket.failed += 1,
                _ => {}
            }
        }

        let avg_retries = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|t| f64::from(t.retry_count)).sum::<f64>() / window.len() as f64
        };

        Ok(AnalyticsSummary {
            window_hours,
            total_tasks: window.len() as u64,
            status_counts,
            avg_duration_seconds: mean(&durations),
            min_duration_seconds: durations.iter().copied().reduce(f64::min),
            max_duration_seconds: durations.iter().copied().reduce(f64::max),
            avg_retries,
            active_workers,
            hourly: buckets.into_values().rev().collect(),
        })
    }

    async fn worker_performance(
        &self,
        worker_id: &WorkerId,
        window_hours: u32,
    ) -> Result<WorkerPerformance, TaskStoreError> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let window: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.created_at >= cutoff)
            .filter(|t| t.worker_id.as_ref() == Some(worker_id))
            .collect();

        let durations: Vec<f64> = window
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .filter_map(|t| t.duration_seconds())
            .collect();

        let avg_retries = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|t| f64::from(t.retry_count)).sum::<f64>() / window.len() as f64
        };

        Ok(WorkerPerformance {
            worker_id: worker_id.clone(),
            window_hours,
            total_tasks: window.len() as u64,
            completed_tasks: window
                .iter()
                .filter(|t| t.status == TaskStatus::Success)
                .count() as u64,
            failed_tasks: window
                .iter()
                .filter(|t| t.status == TaskStatus::Failure)
                .count() as u64,
            avg_duration_seconds: mean(&durations),
            avg_retries,
            first_task_at: window.iter().map(|t| t.created_at).min(),
            last_completed_at: window
                .iter()
                .filter(|t| t.status == TaskStatus::Success)
                .filter_map(|t| t.completed_at)
                .max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use taskgrid_core::{CreateTaskRequest, TaskInput, TaskType};

    use super::*;

    fn new_task(priority: i32) -> Task {
        Task::from_request(
            CreateTaskRequest::new(
                TaskType::Llm,
                "m1",
                TaskInput::new(json!({"prompt": "hi"})),
            )
            .with_priority(priority),
            300,
            3,
        )
    }

    async fn start(store: &InMemoryTaskStore, id: TaskId, worker: &str) -> Task {
        store
            .transition(
                id,
                TaskStatus::Pending,
                TaskTransition::Started {
                    worker_id: Some(WorkerId::new(worker)),
                    broker_handle: format!("h-{id}"),
                },
                "test",
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = InMemoryTaskStore::new();
        let task = new_task(5);
        let id = store.create(task.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(task));
        assert_eq!(store.get(TaskId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryTaskStore::new();
        let task = new_task(5);
        store.create(task.clone()).await.unwrap();
        let err = store.create(task).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn transition_enforces_compare_and_swap() {
        let store = InMemoryTaskStore::new();
        let id = store.create(new_task(5)).await.unwrap();
        start(&store, id, "w1").await;

        // A second writer that still believes the task is pending loses.
        let err = store
            .transition(id, TaskStatus::Pending, TaskTransition::Revoked, "test", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::Conflict {
                expected: TaskStatus::Pending,
                actual: TaskStatus::Started,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transition_appends_status_history() {
        let store = InMemoryTaskStore::new();
        let id = store.create(new_task(5)).await.unwrap();
        start(&store, id, "w1").await;
        store
            .transition(
                id,
                TaskStatus::Started,
                TaskTransition::Succeeded { output: json!("ok") },
                "reconciler",
                Some("worker reported success".into()),
            )
            .await
            .unwrap();

        let history = store.status_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_status, TaskStatus::Success);
        assert_eq!(history[0].changed_by, "reconciler");
        assert_eq!(history[1].old_status, Some(TaskStatus::Pending));
        assert_eq!(history[1].new_status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn ready_tasks_respects_dependencies_and_priority() {
        let store = InMemoryTaskStore::new();
        let dep = store.create(new_task(5)).await.unwrap();
        let low = store.create(new_task(1)).await.unwrap();
        let high = store.create(new_task(9)).await.unwrap();
        store.add_dependency(high, dep, "completion").await.unwrap();

        // Dependency unresolved: only the independent tasks are ready.
        let ready = store.ready_tasks(10).await.unwrap();
        let ids: Vec<TaskId> = ready.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![dep, low]);

        start(&store, dep, "w1").await;
        store
            .transition(
                dep,
                TaskStatus::Started,
                TaskTransition::Succeeded { output: json!(null) },
                "test",
                None,
            )
            .await
            .unwrap();

        // Dependency satisfied: the dependent surfaces, priority first.
        let ready = store.ready_tasks(10).await.unwrap();
        let ids: Vec<TaskId> = ready.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high, low]);
    }

    #[tokio::test]
    async fn skipped_dependency_releases_dependents() {
        let store = InMemoryTaskStore::new();
        let dep = store.create(new_task(5)).await.unwrap();
        let dependent = store.create(new_task(5)).await.unwrap();
        store
            .add_dependency(dependent, dep, "completion")
            .await
            .unwrap();

        store
            .transition(dep, TaskStatus::Pending, TaskTransition::Skipped, "test", None)
            .await
            .unwrap();

        let ready = store.ready_tasks(10).await.unwrap();
        assert!(ready.iter().any(|t| t.id == dependent));
    }

    #[tokio::test]
    async fn delete_cascades_satellite_rows() {
        let store = InMemoryTaskStore::new();
        let id = store.create(new_task(5)).await.unwrap();
        store
            .record_metric(Metric::new(id, "latency", 1.5).with_unit("s"))
            .await
            .unwrap();
        store
            .record_execution_log(ExecutionLogEntry::new(
                id,
                super::super::LogLevel::Info,
                "queued",
            ))
            .await
            .unwrap();
        start(&store, id, "w1").await;

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.metrics_of(id).await.unwrap().is_empty());
        assert!(store.execution_logs(id, 10).await.unwrap().is_empty());
        assert!(store.status_history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_aggregates_window() {
        let store = InMemoryTaskStore::new();
        for _ in 0..3 {
            let id = store.create(new_task(5)).await.unwrap();
            start(&store, id, "w1").await;
            store
                .transition(
                    id,
                    TaskStatus::Started,
                    TaskTransition::Succeeded { output: json!(null) },
                    "test",
                    None,
                )
                .await
                .unwrap();
        }
        let failing = store.create(new_task(5)).await.unwrap();
        start(&store, failing, "w2").await;
        store
            .transition(
                failing,
                TaskStatus::Started,
                TaskTransition::Failed { error: "boom".into() },
                "test",
                None,
            )
            .await
            .unwrap();

        let summary = store.summary(24).await.unwrap();
        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.completed_tasks(), 3);
        assert_eq!(summary.status_counts.get("failure"), Some(&1));
        assert!(summary.avg_duration_seconds.is_some());
        assert_eq!(summary.hourly.iter().map(|b| b.total).sum::<u64>(), 4);
    }

    #[tokio::test]
    async fn worker_performance_scopes_to_worker() {
        let store = InMemoryTaskStore::new();
        let a = store.create(new_task(5)).await.unwrap();
        start(&store, a, "w1").await;
        store
            .transition(
                a,
                TaskStatus::Started,
                TaskTransition::Succeeded { output: json!(null) },
                "test",
                None,
            )
            .await
            .unwrap();
        let b = store.create(new_task(5)).await.unwrap();
        start(&store, b, "w2").await;

        let perf = store
            .worker_performance(&WorkerId::new("w1"), 24)
            .await
            .unwrap();
        assert_eq!(perf.total_tasks, 1);
        assert_eq!(perf.completed_tasks, 1);
        assert_eq!(perf.failed_tasks, 0);
        assert!(perf.last_completed_at.is_some());
    }
}
