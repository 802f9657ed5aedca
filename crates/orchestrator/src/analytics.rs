//! Audit and analytics facade.
//!
//! Reads are plain store queries. Recording paths are best-effort: a
//! metric or trace line that cannot be written is logged and dropped,
//! never allowed to fail the operation that produced it.

use taskgrid_core::{OrchestratorResult, TaskId, WorkerId};
use taskgrid_infra::{
    AnalyticsSummary, ExecutionLogEntry, Metric, StatusHistoryEntry, TaskStore,
    WorkerPerformance,
};

use crate::store_error;

pub struct Analytics<S> {
    store: S,
}

impl<S: TaskStore> Analytics<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Aggregate statistics over tasks created in the last `window_hours`.
    pub async fn summary(&self, window_hours: u32) -> OrchestratorResult<AnalyticsSummary> {
        self.store.summary(window_hours).await.map_err(store_error)
    }

    pub async fn worker_performance(
        &self,
        worker_id: &WorkerId,
        window_hours: u32,
    ) -> OrchestratorResult<WorkerPerformance> {
        self.store
            .worker_performance(worker_id, window_hours)
            .await
            .map_err(store_error)
    }

    /// Record a measurement. Best-effort.
    pub async fn record_metric(&self, metric: Metric) {
        if let Err(err) = self.store.record_metric(metric.clone()).await {
            tracing::warn!(
                task_id = %metric.task_id,
                metric = %metric.name,
                error = %err,
                "metric dropped"
            );
        }
    }

    /// Record an execution trace line. Best-effort.
    pub async fn record_event(&self, entry: ExecutionLogEntry) {
        if let Err(err) = self.store.record_execution_log(entry.clone()).await {
            tracing::warn!(task_id = %entry.task_id, error = %err, "trace line dropped");
        }
    }

    pub async fn execution_logs(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> OrchestratorResult<Vec<ExecutionLogEntry>> {
        self.store
            .execution_logs(task_id, limit)
            .await
            .map_err(store_error)
    }

    pub async fn status_history(
        &self,
        task_id: TaskId,
    ) -> OrchestratorResult<Vec<StatusHistoryEntry>> {
        self.store.status_history(task_id).await.map_err(store_error)
    }

    pub async fn task_metrics(&self, task_id: TaskId) -> OrchestratorResult<Vec<Metric>> {
        self.store.metrics_of(task_id).await.map_err(store_error)
    }

    /// One named metric across all tasks, newest first.
    pub async fn metrics_by_name(
        &self,
        name: &str,
        limit: usize,
    ) -> OrchestratorResult<Vec<Metric>> {
        self.store
            .metrics_by_name(name, limit)
            .await
            .map_err(store_error)
    }
}
