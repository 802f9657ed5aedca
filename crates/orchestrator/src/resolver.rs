//! Dependency graph resolution.
//!
//! Edges are checked for cycles before insertion: a depth-first walk from
//! the prospective dependency must not reach the dependent task. The check
//! runs outside any transaction; a concurrently inserted edge can in
//! principle slip past it, which the ready query tolerates (a cyclic
//! cluster simply never becomes ready).

use std::collections::HashSet;

use taskgrid_core::{OrchestratorError, OrchestratorResult, Task, TaskId};
use taskgrid_infra::{DependencyView, TaskStore};

use crate::store_error;

/// Maintains the dependency graph and surfaces ready work.
pub struct DependencyResolver<S> {
    store: S,
}

impl<S: TaskStore> DependencyResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Insert `task_id -> dependency_task_id` after an acyclicity check.
    pub async fn add_dependency(
        &self,
        task_id: TaskId,
        dependency_task_id: TaskId,
        dependency_type: &str,
    ) -> OrchestratorResult<()> {
        if task_id == dependency_task_id
            || self.reaches(dependency_task_id, task_id).await?
        {
            return Err(OrchestratorError::DependencyCycle {
                task_id,
                dependency_task_id,
            });
        }
        self.store
            .add_dependency(task_id, dependency_task_id, dependency_type)
            .await
            .map_err(store_error)
    }

    /// Dependencies of a task with their current statuses.
    pub async fn dependencies_of(
        &self,
        task_id: TaskId,
    ) -> OrchestratorResult<Vec<DependencyView>> {
        self.store
            .list_dependencies(task_id)
            .await
            .map_err(store_error)
    }

    /// Whether every dependency of the task is satisfied.
    pub async fn is_released(&self, task_id: TaskId) -> OrchestratorResult<bool> {
        let deps = self.dependencies_of(task_id).await?;
        Ok(deps.iter().all(|d| d.dependency_status.satisfies_dependency()))
    }

    /// Pending tasks whose dependencies are all satisfied, most urgent
    /// first.
    pub async fn ready_tasks(&self, limit: usize) -> OrchestratorResult<Vec<Task>> {
        self.store.ready_tasks(limit).await.map_err(store_error)
    }

    /// Depth-first reachability over dependency edges.
    async fn reaches(&self, from: TaskId, target: TaskId) -> OrchestratorResult<bool> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !visited.insert(current) {
                continue;
            }
            let edges = self
                .store
                .dependency_edges(current)
                .await
                .map_err(store_error)?;
            stack.extend(edges.into_iter().map(|e| e.dependency_task_id));
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use taskgrid_core::{CreateTaskRequest, TaskInput, TaskType};
    use taskgrid_infra::InMemoryTaskStore;

    use super::*;

    async fn seed_task(store: &Arc<InMemoryTaskStore>) -> TaskId {
        let task = Task::from_request(
            CreateTaskRequest::new(TaskType::Llm, "m1", TaskInput::new(json!({}))),
            300,
            3,
        );
        store.create(task).await.unwrap()
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = seed_task(&store).await;

        let resolver = DependencyResolver::new(store);
        let err = resolver.add_dependency(a, a, "completion").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn closing_a_chain_into_a_cycle_is_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = seed_task(&store).await;
        let b = seed_task(&store).await;
        let c = seed_task(&store).await;

        let resolver = DependencyResolver::new(store);
        resolver.add_dependency(a, b, "completion").await.unwrap();
        resolver.add_dependency(b, c, "completion").await.unwrap();

        let err = resolver.add_dependency(c, a, "completion").await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::DependencyCycle {
                task_id: c,
                dependency_task_id: a,
            }
        );
    }

    #[tokio::test]
    async fn diamond_graphs_are_acyclic() {
        let store = Arc::new(InMemoryTaskStore::new());
        let top = seed_task(&store).await;
        let left = seed_task(&store).await;
        let right = seed_task(&store).await;
        let bottom = seed_task(&store).await;

        let resolver = DependencyResolver::new(store);
        resolver.add_dependency(left, top, "completion").await.unwrap();
        resolver.add_dependency(right, top, "completion").await.unwrap();
        resolver.add_dependency(bottom, left, "completion").await.unwrap();
        resolver.add_dependency(bottom, right, "completion").await.unwrap();

        assert!(!resolver.is_released(bottom).await.unwrap());
        assert_eq!(resolver.dependencies_of(bottom).await.unwrap().len(), 2);
    }

    #[test]
    fn random_edge_insertion_never_builds_a_cycle() {
        use proptest::prelude::*;

        proptest!(|(edges in proptest::collection::vec((0usize..6, 0usize..6), 0..24))| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let acyclic = rt.block_on(async {
                let store = Arc::new(InMemoryTaskStore::new());
                let mut ids = Vec::new();
                for _ in 0..6 {
                    ids.push(seed_task(&store).await);
                }
                let resolver = DependencyResolver::new(Arc::clone(&store));
                for (a, b) in edges {
                    // Rejections are expected; only accepted edges matter.
                    let _ = resolver.add_dependency(ids[a], ids[b], "completion").await;
                }

                // No node may reach itself along accepted edges.
                for &id in &ids {
                    let mut stack: Vec<TaskId> = store
                        .dependency_edges(id)
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|e| e.dependency_task_id)
                        .collect();
                    let mut visited = std::collections::HashSet::new();
                    while let Some(current) = stack.pop() {
                        if current == id {
                            return false;
                        }
                        if !visited.insert(current) {
                            continue;
                        }
                        let edges = store.dependency_edges(current).await.unwrap();
                        stack.extend(edges.into_iter().map(|e| e.dependency_task_id));
                    }
                }
                true
            });
            prop_assert!(acyclic);
        });
    }

    #[tokio::test]
    async fn unknown_dependency_is_not_found() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = seed_task(&store).await;

        let resolver = DependencyResolver::new(store);
        let err = resolver
            .add_dependency(a, TaskId::new(), "completion")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
