//! Execution broker abstraction.
//!
//! The broker owns remote execution: it accepts routed jobs, reports
//! per-job state, and exposes worker statistics the load balancer reads.
//! The kernel never blocks on job completion; it submits and later
//! reconciles state through the returned handle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use taskgrid_core::WorkerId;

/// Opaque broker-side job reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerHandle(String);

impl BrokerHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for BrokerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BrokerHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Routing directives attached to a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Broker-scale priority, 0 = most urgent.
    pub priority: u8,
    pub queue: String,
    /// Direct-to-worker routing, set when the balancer picked a worker.
    pub routing_key: Option<WorkerId>,
    /// Grace deadline after which the worker should wind down.
    pub soft_timeout_seconds: u64,
    /// Hard kill deadline.
    pub hard_timeout_seconds: u64,
}

/// A unit of work handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJob {
    /// Registered handler name, e.g. `tasks.llm_inference`.
    pub task_name: String,
    pub payload: JsonValue,
    pub routing: RoutingOptions,
}

/// Broker-reported state of a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerTaskState {
    Pending,
    Started,
    Retry,
    Success { result: JsonValue },
    Failure { error: String },
    Revoked,
}

/// Point-in-time load snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub online: bool,
    /// Jobs currently executing.
    pub active: u64,
    /// Jobs with a future ETA.
    pub scheduled: u64,
    /// Jobs prefetched but not yet executing.
    pub reserved: u64,
}

impl WorkerStats {
    pub fn new(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            online: true,
            active: 0,
            scheduled: 0,
            reserved: 0,
        }
    }

    pub fn with_load(mut self, active: u64, scheduled: u64, reserved: u64) -> Self {
        self.active = active;
        self.scheduled = scheduled;
        self.reserved = reserved;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    /// Total observable load, the balancer's comparison key.
    pub fn load(&self) -> u64 {
        self.active + self.scheduled + self.reserved
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("unknown broker handle: {0}")]
    UnknownHandle(String),
}

/// Interface to the remote execution fabric.
#[async_trait::async_trait]
pub trait ExecutionBroker: Send + Sync {
    /// Submit a job for asynchronous execution.
    async fn submit(&self, job: BrokerJob) -> Result<BrokerHandle, BrokerError>;

    /// Current state of a previously submitted job.
    async fn task_state(&self, handle: &BrokerHandle) -> Result<BrokerTaskState, BrokerError>;

    /// Ask the broker to cancel a job. `terminate` also kills an already
    /// running execution.
    async fn revoke(&self, handle: &BrokerHandle, terminate: bool) -> Result<(), BrokerError>;

    /// Load snapshot of every known worker.
    async fn worker_stats(&self) -> Result<Vec<WorkerStats>, BrokerError>;

    /// Pending-message depth per queue.
    async fn queue_depths(&self) -> Result<HashMap<String, u64>, BrokerError>;
}

#[async_trait::async_trait]
impl<B> ExecutionBroker for std::sync::Arc<B>
where
    B: ExecutionBroker + ?Sized,
{
    async fn submit(&self, job: BrokerJob) -> Result<BrokerHandle, BrokerError> {
        (**self).submit(job).await
    }

    async fn task_state(&self, handle: &BrokerHandle) -> Result<BrokerTaskState, BrokerError> {
        (**self).task_state(handle).await
    }

    async fn revoke(&self, handle: &BrokerHandle, terminate: bool) -> Result<(), BrokerError> {
        (**self).revoke(handle, terminate).await
    }

    async fn worker_stats(&self) -> Result<Vec<WorkerStats>, BrokerError> {
        (**self).worker_stats().await
    }

    async fn queue_depths(&self) -> Result<HashMap<String, u64>, BrokerError> {
        (**self).queue_depths().await
    }
}

#[derive(Default)]
struct InProcessState {
    jobs: HashMap<String, (BrokerJob, BrokerTaskState)>,
    workers: Vec<WorkerStats>,
    fail_submissions: Option<String>,
}

/// Scriptable in-process broker.
///
/// Jobs are accepted and parked in `Pending`; tests (and single-process
/// deployments that drive jobs themselves) advance them with `set_state`,
/// `complete` or `fail`.
#[derive(Default)]
pub struct InProcessBroker {
    state: Mutex<InProcessState>,
    next_handle: AtomicU64,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_workers(&self, workers: Vec<WorkerStats>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).workers = workers;
    }

    /// Make every subsequent `submit` fail with `Rejected(reason)`.
    pub fn fail_submissions(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_submissions = Some(reason.into());
    }

    pub fn accept_submissions(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail_submissions = None;
    }

    pub fn set_state(&self, handle: &BrokerHandle, state: BrokerTaskState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = guard.jobs.get_mut(handle.as_str()) {
            entry.1 = state;
        }
    }

    pub fn complete(&self, handle: &BrokerHandle, result: JsonValue) {
        self.set_state(handle, BrokerTaskState::Success { result });
    }

    pub fn fail(&self, handle: &BrokerHandle, error: impl Into<String>) {
        self.set_state(handle, BrokerTaskState::Failure { error: error.into() });
    }

    /// Every job accepted so far, in submission order of handle allocation.
    pub fn submitted(&self) -> Vec<BrokerJob> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<(String, BrokerJob)> = guard
            .jobs
            .iter()
            .map(|(handle, (job, _))| (handle.clone(), job.clone()))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0));
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub fn last_handle(&self) -> Option<BrokerHandle> {
        let n = self.next_handle.load(Ordering::SeqCst);
        if n == 0 {
            None
        } else {
            Some(BrokerHandle::new(format!("inproc-{:08}", n - 1)))
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBroker for InProcessBroker {
    async fn submit(&self, job: BrokerJob) -> Result<BrokerHandle, BrokerError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reason) = &guard.fail_submissions {
            return Err(BrokerError::Rejected(reason.clone()));
        }
        let seq = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = BrokerHandle::new(format!("inproc-{seq:08}"));
        guard
            .jobs
            .insert(handle.as_str().to_string(), (job, BrokerTaskState::Pending));
        Ok(handle)
    }

    async fn task_state(&self, handle: &BrokerHandle) -> Result<BrokerTaskState, BrokerError> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .jobs
            .get(handle.as_str())
            .map(|(_, state)| state.clone())
            .ok_or_else(|| BrokerError::UnknownHandle(handle.to_string()))
    }

    async fn revoke(&self, handle: &BrokerHandle, _terminate: bool) -> Result<(), BrokerError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match guard.jobs.get_mut(handle.as_str()) {
            Some(entry) => {
                entry.1 = BrokerTaskState::Revoked;
                Ok(())
            }
            None => Err(BrokerError::UnknownHandle(handle.to_string())),
        }
    }

    async fn worker_stats(&self) -> Result<Vec<WorkerStats>, BrokerError> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.workers.clone())
    }

    async fn queue_depths(&self) -> Result<HashMap<String, u64>, BrokerError> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut depths: HashMap<String, u64> = HashMap::new();
        for (job, state) in guard.jobs.values() {
            if matches!(state, BrokerTaskState::Pending) {
                *depths.entry(job.routing.queue.clone()).or_insert(0) += 1;
            }
        }
        Ok(depths)
    }
}
