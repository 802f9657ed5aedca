//! Postgres-backed `TaskStore`.
//!
//! Schema is applied idempotently at startup via `ensure_schema`. The
//! compare-and-swap in `transition` is a row lock plus conditional update
//! inside one transaction, so the status-history row and the task update
//! commit together.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use taskgrid_core::{Task, TaskId, TaskStatus, TaskTransition, TaskType, WorkerId};

use super::{
    AnalyticsSummary, Dependency, DependencyView, ExecutionLogEntry, HourlyBucket, LogLevel,
    Metric, StatusHistoryEntry, TaskFilter, TaskStore, TaskStoreError, WorkerAssignment,
    WorkerPerformance,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              UUID PRIMARY KEY,
    task_type       TEXT NOT NULL,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    model_id        TEXT NOT NULL,
    worker_id       TEXT,
    input           JSONB NOT NULL,
    output          JSONB,
    error           TEXT,
    broker_handle   TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    timeout_seconds BIGINT NOT NULL,
    retry_count     INTEGER NOT NULL,
    max_retries     INTEGER NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_worker_id ON tasks (worker_id);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id            UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    dependency_task_id UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    dependency_type    TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (task_id, dependency_task_id)
);

CREATE TABLE IF NOT EXISTS task_metrics (
    id          BIGSERIAL PRIMARY KEY,
    task_id     UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    value       DOUBLE PRECISION NOT NULL,
    unit        TEXT NOT NULL DEFAULT '',
    recorded_at TIMESTAMPTZ NOT NULL,
    metadata    JSONB NOT NULL DEFAULT 'null'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_task_metrics_task_id ON task_metrics (task_id);
CREATE INDEX IF NOT EXISTS idx_task_metrics_name ON task_metrics (name);

CREATE TABLE IF NOT EXISTS task_execution_logs (
    id          BIGSERIAL PRIMARY KEY,
    task_id     UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    level       TEXT NOT NULL,
    message     TEXT NOT NULL,
    worker_id   TEXT,
    step        TEXT,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_execution_logs_task_id ON task_execution_logs (task_id);

CREATE TABLE IF NOT EXISTS task_status_history (
    id         BIGSERIAL PRIMARY KEY,
    task_id    UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    old_status TEXT,
    new_status TEXT NOT NULL,
    changed_by TEXT NOT NULL,
    reason     TEXT,
    changed_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_status_history_task_id ON task_status_history (task_id);

CREATE TABLE IF NOT EXISTS worker_assignments (
    id                   BIGSERIAL PRIMARY KEY,
    worker_id            TEXT NOT NULL,
    task_id              UUID NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    assignment_score     DOUBLE PRECISION NOT NULL,
    estimated_completion TIMESTAMPTZ,
    assigned_at          TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_worker_assignments_worker_id ON worker_assignments (worker_id);
"#;

const TASK_COLUMNS: &str = "id, task_type, status, priority, model_id, worker_id, input, output, \
     error, broker_handle, created_at, started_at, completed_at, timeout_seconds, retry_count, \
     max_retries, metadata";

/// `TaskStore` on a shared `PgPool`.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

fn unavailable(err: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Unavailable(err.to_string())
}

fn corrupt(what: &str, value: &str) -> TaskStoreError {
    TaskStoreError::Unavailable(format!("corrupt {what} in storage: {value}"))
}

fn parse_status(s: &str) -> Result<TaskStatus, TaskStoreError> {
    s.parse().map_err(|_| corrupt("status", s))
}

fn parse_task_type(s: &str) -> Result<TaskType, TaskStoreError> {
    match s {
        "llm" => Ok(TaskType::Llm),
        "image" => Ok(TaskType::Image),
        "tts" => Ok(TaskType::Tts),
        "image_to_text" => Ok(TaskType::ImageToText),
        other => Err(corrupt("task_type", other)),
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, TaskStoreError> {
    let status: String = row.try_get("status").map_err(unavailable)?;
    let task_type: String = row.try_get("task_type").map_err(unavailable)?;
    let input: JsonValue = row.try_get("input").map_err(unavailable)?;
    let metadata: JsonValue = row.try_get("metadata").map_err(unavailable)?;
    let timeout_seconds: i64 = row.try_get("timeout_seconds").map_err(unavailable)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(unavailable)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(unavailable)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(unavailable)?;

    Ok(Task {
        id: TaskId::from_uuid(row.try_get("id").map_err(unavailable)?),
        task_type: parse_task_type(&task_type)?,
        status: parse_status(&status)?,
        priority: row.try_get("priority").map_err(unavailable)?,
        model_id: row.try_get("model_id").map_err(unavailable)?,
        worker_id: worker_id.map(WorkerId::new),
        input: serde_json::from_value(input).map_err(|e| corrupt("input", &e.to_string()))?,
        output: row.try_get("output").map_err(unavailable)?,
        error: row.try_get("error").map_err(unavailable)?,
        broker_handle: row.try_get("broker_handle").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        started_at: row.try_get("started_at").map_err(unavailable)?,
        completed_at: row.try_get("completed_at").map_err(unavailable)?,
        timeout_seconds: u64::try_from(timeout_seconds).unwrap_or(0),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        metadata: match metadata {
            JsonValue::Object(map) => map,
            _ => serde_json::Map::new(),
        },
    })
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Statements are idempotent; safe to run at every
    /// startup.
    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        tracing::debug!("task schema ensured");
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        let metadata = JsonValue::Object(task.metadata.clone());
        let input =
            serde_json::to_value(&task.input).map_err(|e| corrupt("input", &e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO tasks (id, task_type, status, priority, model_id, worker_id, input, \
             output, error, broker_handle, created_at, started_at, completed_at, \
             timeout_seconds, retry_count, max_retries, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(Uuid::from(task.id))
        .bind(task.task_type.to_string())
        .bind(task.status.to_string())
        .bind(task.priority)
        .bind(&task.model_id)
        .bind(task.worker_id.as_ref().map(|w| w.as_str()))
        .bind(input)
        .bind(&task.output)
        .bind(&task.error)
        .bind(&task.broker_handle)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.timeout_seconds as i64)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        Ok(task.id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR task_type = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4",
        ))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.task_type.map(|t| t.to_string()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<Task, TaskStoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;
        let mut task = match row.as_ref() {
            Some(row) => task_from_row(row)?,
            None => return Err(TaskStoreError::NotFound(id)),
        };

        if task.status != expected {
            return Err(TaskStoreError::Conflict {
                task_id: id,
                expected,
                actual: task.status,
            });
        }

        let now = Utc::now();
        task.apply(&transition, now)
            .map_err(|_| TaskStoreError::InvalidTransition {
                task_id: id,
                from: expected,
                to: transition.target_status(),
            })?;

        sqlx::query(
            "UPDATE tasks SET status = $2, worker_id = $3, output = $4, error = $5, \
             broker_handle = $6, started_at = $7, completed_at = $8, retry_count = $9, \
             max_retries = $10 \
             WHERE id = $1",
        )
        .bind(Uuid::from(id))
        .bind(task.status.to_string())
        .bind(task.worker_id.as_ref().map(|w| w.as_str()))
        .bind(&task.output)
        .bind(&task.error)
        .bind(&task.broker_handle)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            "INSERT INTO task_status_history \
             (task_id, old_status, new_status, changed_by, reason, changed_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::from(id))
        .bind(expected.to_string())
        .bind(task.status.to_string())
        .bind(changed_by)
        .bind(&reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(task)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_dependency(
        &self,
        task_id: TaskId,
        dependency_task_id: TaskId,
        dependency_type: &str,
    ) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            "INSERT INTO task_dependencies (task_id, dependency_task_id, dependency_type, created_at) \
             SELECT $1, $2, $3, $4 \
             WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $1) \
               AND EXISTS (SELECT 1 FROM tasks WHERE id = $2) \
             ON CONFLICT (task_id, dependency_task_id) DO NOTHING",
        )
        .bind(Uuid::from(task_id))
        .bind(Uuid::from(dependency_task_id))
        .bind(dependency_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            // Either both tasks exist and the edge was already there (fine),
            // or one side is missing. Distinguish with a lookup.
            for id in [task_id, dependency_task_id] {
                if self.get(id).await?.is_none() {
                    return Err(TaskStoreError::NotFound(id));
                }
            }
        }
        Ok(())
    }

    async fn dependency_edges(&self, task_id: TaskId) -> Result<Vec<Dependency>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT task_id, dependency_task_id, dependency_type, created_at \
             FROM task_dependencies WHERE task_id = $1",
        )
        .bind(Uuid::from(task_id))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(Dependency {
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    dependency_task_id: TaskId::from_uuid(
                        row.try_get("dependency_task_id").map_err(unavailable)?,
                    ),
                    dependency_type: row.try_get("dependency_type").map_err(unavailable)?,
                    created_at: row.try_get("created_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn list_dependencies(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<DependencyView>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT d.dependency_task_id, d.dependency_type, d.created_at, \
                    t.status, t.task_type \
             FROM task_dependencies d \
             JOIN tasks t ON t.id = d.dependency_task_id \
             WHERE d.task_id = $1 \
             ORDER BY d.created_at ASC",
        )
        .bind(Uuid::from(task_id))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(unavailable)?;
                let task_type: String = row.try_get("task_type").map_err(unavailable)?;
                Ok(DependencyView {
                    dependency_task_id: TaskId::from_uuid(
                        row.try_get("dependency_task_id").map_err(unavailable)?,
                    ),
                    dependency_type: row.try_get("dependency_type").map_err(unavailable)?,
                    dependency_status: parse_status(&status)?,
                    dependency_task_type: parse_task_type(&task_type)?,
                    created_at: row.try_get("created_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn ready_tasks(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.status = 'pending' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_dependencies d \
                   JOIN tasks dep ON dep.id = d.dependency_task_id \
                   WHERE d.task_id = t.id \
                     AND dep.status NOT IN ('success', 'skipped')) \
             ORDER BY t.priority DESC, t.created_at ASC \
             LIMIT $1",
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn record_assignment(
        &self,
        assignment: WorkerAssignment,
    ) -> Result<(), TaskStoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let updated = sqlx::query("UPDATE tasks SET worker_id = $2 WHERE id = $1")
            .bind(Uuid::from(assignment.task_id))
            .bind(assignment.worker_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        if updated.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(assignment.task_id));
        }

        sqlx::query(
            "INSERT INTO worker_assignments \
             (worker_id, task_id, assignment_score, estimated_completion, assigned_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(assignment.worker_id.as_str())
        .bind(Uuid::from(assignment.task_id))
        .bind(assignment.assignment_score)
        .bind(assignment.estimated_completion)
        .bind(assignment.assigned_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn assignments(
        &self,
        worker_id: Option<&WorkerId>,
        active_only: bool,
    ) -> Result<Vec<WorkerAssignment>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT a.worker_id, a.task_id, a.assignment_score, a.estimated_completion, \
                    a.assigned_at \
             FROM worker_assignments a \
             JOIN tasks t ON t.id = a.task_id \
             WHERE ($1::text IS NULL OR a.worker_id = $1) \
               AND (NOT $2 OR t.status IN ('pending', 'started', 'retry')) \
             ORDER BY a.assigned_at DESC",
        )
        .bind(worker_id.map(|w| w.as_str()))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let worker: String = row.try_get("worker_id").map_err(unavailable)?;
                Ok(WorkerAssignment {
                    worker_id: WorkerId::new(worker),
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    assignment_score: row.try_get("assignment_score").map_err(unavailable)?,
                    estimated_completion: row
                        .try_get("estimated_completion")
                        .map_err(unavailable)?,
                    assigned_at: row.try_get("assigned_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn record_metric(&self, metric: Metric) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            "INSERT INTO task_metrics (task_id, name, value, unit, recorded_at, metadata) \
             SELECT $1, $2, $3, $4, $5, $6 \
             WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $1)",
        )
        .bind(Uuid::from(metric.task_id))
        .bind(&metric.name)
        .bind(metric.value)
        .bind(&metric.unit)
        .bind(metric.recorded_at)
        .bind(&metric.metadata)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(metric.task_id));
        }
        Ok(())
    }

    async fn metrics_of(&self, task_id: TaskId) -> Result<Vec<Metric>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT task_id, name, value, unit, recorded_at, metadata \
             FROM task_metrics WHERE task_id = $1 ORDER BY recorded_at ASC",
        )
        .bind(Uuid::from(task_id))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(Metric {
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    name: row.try_get("name").map_err(unavailable)?,
                    value: row.try_get("value").map_err(unavailable)?,
                    unit: row.try_get("unit").map_err(unavailable)?,
                    recorded_at: row.try_get("recorded_at").map_err(unavailable)?,
                    metadata: row.try_get("metadata").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn metrics_by_name(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Metric>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT task_id, name, value, unit, recorded_at, metadata \
             FROM task_metrics WHERE name = $1 \
             ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(Metric {
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    name: row.try_get("name").map_err(unavailable)?,
                    value: row.try_get("value").map_err(unavailable)?,
                    unit: row.try_get("unit").map_err(unavailable)?,
                    recorded_at: row.try_get("recorded_at").map_err(unavailable)?,
                    metadata: row.try_get("metadata").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn record_execution_log(
        &self,
        entry: ExecutionLogEntry,
    ) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            "INSERT INTO task_execution_logs \
             (task_id, level, message, worker_id, step, recorded_at) \
             SELECT $1, $2, $3, $4, $5, $6 \
             WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $1)",
        )
        .bind(Uuid::from(entry.task_id))
        .bind(entry.level.to_string())
        .bind(&entry.message)
        .bind(entry.worker_id.as_ref().map(|w| w.as_str()))
        .bind(&entry.step)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(entry.task_id));
        }
        Ok(())
    }

    async fn execution_logs(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT task_id, level, message, worker_id, step, recorded_at \
             FROM task_execution_logs WHERE task_id = $1 \
             ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(Uuid::from(task_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level").map_err(unavailable)?;
                let worker: Option<String> = row.try_get("worker_id").map_err(unavailable)?;
                Ok(ExecutionLogEntry {
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    level: level.parse::<LogLevel>().map_err(|_| corrupt("level", &level))?,
                    message: row.try_get("message").map_err(unavailable)?,
                    worker_id: worker.map(WorkerId::new),
                    step: row.try_get("step").map_err(unavailable)?,
                    recorded_at: row.try_get("recorded_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn status_history(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<StatusHistoryEntry>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT task_id, old_status, new_status, changed_by, reason, changed_at \
             FROM task_status_history WHERE task_id = $1 ORDER BY changed_at DESC, id DESC",
        )
        .bind(Uuid::from(task_id))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let old: Option<String> = row.try_get("old_status").map_err(unavailable)?;
                let new: String = row.try_get("new_status").map_err(unavailable)?;
                Ok(StatusHistoryEntry {
                    task_id: TaskId::from_uuid(row.try_get("task_id").map_err(unavailable)?),
                    old_status: old.as_deref().map(parse_status).transpose()?,
                    new_status: parse_status(&new)?,
                    changed_by: row.try_get("changed_by").map_err(unavailable)?,
                    reason: row.try_get("reason").map_err(unavailable)?,
                    changed_at: row.try_get("changed_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn summary(&self, window_hours: u32) -> Result<AnalyticsSummary, TaskStoreError> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    AVG(retry_count)::float8 AS avg_retries, \
                    (AVG(EXTRACT(EPOCH FROM (completed_at - created_at))) \
                        FILTER (WHERE status = 'success'))::float8 AS avg_duration, \
                    (MIN(EXTRACT(EPOCH FROM (completed_at - created_at))) \
                        FILTER (WHERE status = 'success'))::float8 AS min_duration, \
                    (MAX(EXTRACT(EPOCH FROM (completed_at - created_at))) \
                        FILTER (WHERE status = 'success'))::float8 AS max_duration \
             FROM tasks WHERE created_at >= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM tasks \
             WHERE created_at >= $1 GROUP BY status",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut status_counts = BTreeMap::new();
        for row in &status_rows {
            let status: String = row.try_get("status").map_err(unavailable)?;
            let n: i64 = row.try_get("n").map_err(unavailable)?;
            status_counts.insert(status, n.max(0) as u64);
        }

        let active_workers: i64 = sqlx::query(
            "SELECT COUNT(DISTINCT worker_id) AS n FROM tasks \
             WHERE status IN ('started', 'retry') AND worker_id IS NOT NULL \
               AND created_at >= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?
        .try_get("n")
        .map_err(unavailable)?;

        let hourly_rows = sqlx::query(
            "SELECT date_trunc('hour', created_at) AS hour, \
                    COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = 'success') AS succeeded, \
                    COUNT(*) FILTER (WHERE status = 'failure') AS failed \
             FROM tasks WHERE created_at >= $1 \
             GROUP BY hour ORDER BY hour DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let hourly = hourly_rows
            .iter()
            .map(|row| {
                let total: i64 = row.try_get("total").map_err(unavailable)?;
                let succeeded: i64 = row.try_get("succeeded").map_err(unavailable)?;
                let failed: i64 = row.try_get("failed").map_err(unavailable)?;
                Ok(HourlyBucket {
                    hour: row.try_get::<DateTime<Utc>, _>("hour").map_err(unavailable)?,
                    total: total.max(0) as u64,
                    succeeded: succeeded.max(0) as u64,
                    failed: failed.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>, TaskStoreError>>()?;

        let total: i64 = totals.try_get("total").map_err(unavailable)?;
        let avg_retries: Option<f64> = totals.try_get("avg_retries").map_err(unavailable)?;

        Ok(AnalyticsSummary {
            window_hours,
            total_tasks: total.max(0) as u64,
            status_counts,
            avg_duration_seconds: totals.try_get("avg_duration").map_err(unavailable)?,
            min_duration_seconds: totals.try_get("min_duration").map_err(unavailable)?,
            max_duration_seconds: totals.try_get("max_duration").map_err(unavailable)?,
            avg_retries: avg_retries.unwrap_or(0.0),
            active_workers: active_workers.max(0) as u64,
            hourly,
        })
    }

    async fn worker_performance(
        &self,
        worker_id: &WorkerId,
        window_hours: u32,
    ) -> Result<WorkerPerformance, TaskStoreError> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));

        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE status = 'success') AS completed, \
                    COUNT(*) FILTER (WHERE status = 'failure') AS failed, \
                    (AVG(EXTRACT(EPOCH FROM (completed_at - created_at))) \
                        FILTER (WHERE status = 'success'))::float8 AS avg_duration, \
                    AVG(retry_count)::float8 AS avg_retries, \
                    MIN(created_at) AS first_task_at, \
                    MAX(completed_at) FILTER (WHERE status = 'success') AS last_completed_at \
             FROM tasks WHERE worker_id = $1 AND created_at >= $2",
        )
        .bind(worker_id.as_str())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let total: i64 = row.try_get("total").map_err(unavailable)?;
        let completed: i64 = row.try_get("completed").map_err(unavailable)?;
        let failed: i64 = row.try_get("failed").map_err(unavailable)?;
        let avg_retries: Option<f64> = row.try_get("avg_retries").map_err(unavailable)?;

        Ok(WorkerPerformance {
            worker_id: worker_id.clone(),
            window_hours,
            total_tasks: total.max(0) as u64,
            completed_tasks: completed.max(0) as u64,
            failed_tasks: failed.max(0) as u64,
            avg_duration_seconds: row.try_get("avg_duration").map_err(unavailable)?,
            avg_retries: avg_retries.unwrap_or(0.0),
            first_task_at: row.try_get("first_task_at").map_err(unavailable)?,
            last_completed_at: row.try_get("last_completed_at").map_err(unavailable)?,
        })
    }
}
