//! Strongly-typed identifiers used across the kernel.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Identifier of a task. Allocated by the kernel, never caller-supplied.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TaskId> for Uuid {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl FromStr for TaskId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| OrchestratorError::invalid_id(format!("TaskId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identifier of a broker-registered worker.
///
/// Worker names are assigned by the broker (e.g. `gpu-worker@host-03`).
/// `Ord` is lexical, which is what the load balancer's deterministic
/// tie-break relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_round_trip() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);

        let parsed: TaskId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn invalid_task_id_is_rejected() {
        let err = "not-a-uuid".parse::<TaskId>().unwrap_err();
        assert!(err.to_string().contains("TaskId"));
    }

    #[test]
    fn worker_ids_order_lexically() {
        let a = WorkerId::new("gpu-worker@host-01");
        let b = WorkerId::new("gpu-worker@host-02");
        assert!(a < b);
    }
}
