//! Worker load balancing.
//!
//! Selection reads live load from the broker: a worker's load is its
//! active plus scheduled plus reserved jobs. The least-loaded online
//! worker wins; equal loads break on worker id, so repeated selections
//! under identical load are deterministic.

use std::collections::HashMap;

use taskgrid_core::{OrchestratorError, OrchestratorResult, TaskType, WorkerId};
use taskgrid_infra::{ExecutionBroker, WorkerStats};

/// Outcome of a worker selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedWorker {
    pub worker_id: WorkerId,
    pub load: u64,
    /// Inverse-load score recorded with the assignment.
    pub score: f64,
}

/// Broker-backed load balancer.
pub struct WorkerBalancer<B> {
    broker: B,
}

impl<B: ExecutionBroker> WorkerBalancer<B> {
    pub fn new(broker: B) -> Self {
        Self { broker }
    }

    /// Pick the least-loaded online worker for a task, if any worker is
    /// online. Eligibility is type-agnostic today: every worker serves the
    /// shared queue.
    pub async fn select_worker(
        &self,
        task_type: TaskType,
    ) -> OrchestratorResult<Option<SelectedWorker>> {
        let stats = self
            .broker
            .worker_stats()
            .await
            .map_err(|e| OrchestratorError::dispatch_failure(e.to_string()))?;
        let selected = pick(&stats);
        if let Some(worker) = &selected {
            tracing::debug!(
                task_type = %task_type,
                worker_id = %worker.worker_id,
                load = worker.load,
                "worker selected"
            );
        }
        Ok(selected)
    }

    /// Load snapshot of every known worker, for health endpoints.
    pub async fn worker_health(&self) -> OrchestratorResult<Vec<WorkerStats>> {
        self.broker
            .worker_stats()
            .await
            .map_err(|e| OrchestratorError::dispatch_failure(e.to_string()))
    }

    /// Pending-message depth per queue.
    pub async fn queue_depths(&self) -> OrchestratorResult<HashMap<String, u64>> {
        self.broker
            .queue_depths()
            .await
            .map_err(|e| OrchestratorError::dispatch_failure(e.to_string()))
    }
}

fn pick(stats: &[WorkerStats]) -> Option<SelectedWorker> {
    stats
        .iter()
        .filter(|w| w.online)
        .min_by(|a, b| a.load().cmp(&b.load()).then(a.worker_id.cmp(&b.worker_id)))
        .map(|w| SelectedWorker {
            worker_id: w.worker_id.clone(),
            load: w.load(),
            score: 1.0 / (1.0 + w.load() as f64),
        })
}
