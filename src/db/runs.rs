//! Run and step-task operations: creation, state tracking, dispatch.
//!
//! Every transition is a conditional UPDATE on the expected prior state and
//! the claiming worker, so a stale worker can never overwrite progress made
//! by the lease holder. Transitions that put a task on a queue commit the
//! row change, the pgmq message and the notification in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use std::time::Duration;
use uuid::Uuid;

use super::notify::notify_on;
use super::pgmq::{delete_on, send_on};
use crate::error::{Error, Result};
use crate::model::*;
use crate::notify::channel_for;
use crate::queue::{dead_letter_entry, dead_letter_queue};
use crate::store::{NewRun, RunStore};
use crate::telemetry::metrics;

const RUN_COLUMNS: &str = "id, workflow_id, workflow_name, version, input, status, attempt, error, created_at, updated_at, completed_at";

const TASK_COLUMNS: &str = "id, run_id, step_id, queue_name, status, attempt, failures, degraded, result, error, claimed_by, lease_expires_at, msg_id, duration_ms, created_at, updated_at, completed_at";

fn record_transition(from: TaskStatus, to: TaskStatus) {
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Send a task's envelope and wake the queue's listeners, inside `conn`'s
/// transaction.
async fn dispatch_on(
    conn: &mut PgConnection,
    queue: &str,
    envelope: &TaskEnvelope,
    delay: Duration,
) -> Result<i64> {
    let msg_id = send_on(&mut *conn, queue, &envelope.to_json(), delay).await?;
    if delay.is_zero() {
        notify_on(&mut *conn, &channel_for(queue), queue).await?;
    }
    Ok(msg_id)
}

impl super::Db {
    async fn fetch_run(&self, id: RunId) -> Result<Run> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("run {id}")))?
            .try_into_run()
    }

    async fn fetch_task(&self, id: TaskId) -> Result<StepTask> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM step_tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("step task {id}")))?
            .try_into_task()
    }
}

#[async_trait]
impl RunStore for super::Db {
    async fn register_definition(&self, def: &WorkflowDefinition) -> Result<RegisteredDefinition> {
        self.insert_definition(def).await
    }

    async fn get_definition(&self, r: &DefinitionRef) -> Result<RegisteredDefinition> {
        self.fetch_definition(r).await
    }

    async fn list_definitions(&self) -> Result<Vec<RegisteredDefinition>> {
        self.fetch_definitions().await
    }

    async fn create_run(&self, new: NewRun) -> Result<Run> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let row: RunRow = sqlx::query_as(&format!(
            "INSERT INTO workflow_runs (id, workflow_id, workflow_name, version, input, status, attempt, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', 1, $6, $6)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(new.id.0)
        .bind(new.workflow_id)
        .bind(&new.workflow_name)
        .bind(&new.version)
        .bind(&new.input)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (seq, task) in new.tasks.iter().enumerate() {
            let msg_id = if task.status == TaskStatus::Queued {
                validate_transition(TaskStatus::Blocked, TaskStatus::Queued)?;
                let envelope = TaskEnvelope {
                    run_id: new.id,
                    task_id: task.id,
                    step_id: task.step_id.clone(),
                };
                Some(dispatch_on(&mut *tx, &task.queue_name, &envelope, Duration::ZERO).await?)
            } else {
                None
            };

            sqlx::query(
                "INSERT INTO step_tasks (id, run_id, step_id, queue_name, status, msg_id, seq, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
            )
            .bind(task.id.0)
            .bind(new.id.0)
            .bind(&task.step_id)
            .bind(&task.queue_name)
            .bind(task.status.to_string())
            .bind(msg_id)
            .bind(seq as i32)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.try_into_run()
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        self.fetch_run(id).await
    }

    async fn list_runs(&self, workflow: &str, limit: i64) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs
             WHERE workflow_name = $1
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(workflow)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(RunRow::try_into_run).collect()
    }

    async fn get_task(&self, id: TaskId) -> Result<StepTask> {
        self.fetch_task(id).await
    }

    async fn list_tasks(&self, run: RunId) -> Result<Vec<StepTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM step_tasks WHERE run_id = $1 ORDER BY seq"
        ))
        .bind(run.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn mark_run_running(&self, id: RunId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE workflow_runs SET status = 'running', updated_at = now()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn finish_run(&self, id: RunId, status: RunStatus, error: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: "running".to_string(),
                to: status.to_string(),
            });
        }

        let rows_affected = sqlx::query(
            "UPDATE workflow_runs SET status = $1, error = $2, updated_at = now(), completed_at = now()
             WHERE id = $3 AND status IN ('pending', 'running')",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn reset_run(&self, id: RunId, roots: &[String]) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let bumped: Option<(i32,)> = sqlx::query_as(
            "UPDATE workflow_runs
             SET status = 'running', attempt = attempt + 1, error = NULL, updated_at = now()
             WHERE id = $1 AND status IN ('pending', 'running')
             RETURNING attempt",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if bumped.is_none() {
            return Ok(false);
        }

        // Withdraw every outstanding message so stale deliveries cannot
        // claim the reset tasks.
        let outstanding: Vec<(String, i64)> = sqlx::query_as(
            "SELECT queue_name, msg_id FROM step_tasks
             WHERE run_id = $1 AND msg_id IS NOT NULL
             FOR UPDATE",
        )
        .bind(id.0)
        .fetch_all(&mut *tx)
        .await?;
        for (queue, msg_id) in &outstanding {
            delete_on(&mut *tx, queue, *msg_id).await?;
        }

        sqlx::query(
            "UPDATE step_tasks
             SET status = 'blocked', attempt = 0, failures = 0, degraded = false,
                 result = NULL, error = NULL, claimed_by = NULL, lease_expires_at = NULL,
                 msg_id = NULL, duration_ms = NULL, completed_at = NULL, updated_at = now()
             WHERE run_id = $1",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        let root_tasks: Vec<(Uuid, String, String)> = sqlx::query_as(
            "SELECT id, step_id, queue_name FROM step_tasks
             WHERE run_id = $1 AND step_id = ANY($2)",
        )
        .bind(id.0)
        .bind(roots)
        .fetch_all(&mut *tx)
        .await?;
        for (task_id, step_id, queue) in root_tasks {
            let envelope = TaskEnvelope {
                run_id: id,
                task_id: TaskId(task_id),
                step_id,
            };
            let msg_id = dispatch_on(&mut *tx, &queue, &envelope, Duration::ZERO).await?;
            sqlx::query("UPDATE step_tasks SET status = 'queued', msg_id = $1 WHERE id = $2")
                .bind(msg_id)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn claim_task(
        &self,
        id: TaskId,
        worker: &str,
        msg_id: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<StepTask>> {
        let mut tx = self.pool().begin().await?;

        let current: Option<(String, Option<DateTime<Utc>>, Option<i64>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT status, lease_expires_at, msg_id, now() FROM step_tasks
                 WHERE id = $1 FOR UPDATE",
            )
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((status, lease, current_msg, now)) = current else {
            return Ok(None);
        };
        let from: TaskStatus = status.parse()?;

        let claimable = match from {
            TaskStatus::Queued => true,
            s if s.is_leased() => lease.is_none_or(|t| t <= now),
            _ => false,
        };
        if !claimable || current_msg != Some(msg_id) || !from.can_transition_to(TaskStatus::Claimed) {
            return Ok(None);
        }

        let row: TaskRow = sqlx::query_as(&format!(
            "UPDATE step_tasks
             SET status = 'claimed', claimed_by = $1, lease_expires_at = $2, updated_at = now()
             WHERE id = $3
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(worker)
        .bind(lease_expires_at)
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        record_transition(from, TaskStatus::Claimed);
        Ok(Some(row.try_into_task()?))
    }

    async fn start_task(&self, id: TaskId, worker: &str) -> Result<StepTask> {
        validate_transition(TaskStatus::Claimed, TaskStatus::Running)?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE step_tasks
             SET status = 'running', attempt = attempt + 1, updated_at = now()
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .bind(worker)
        .fetch_optional(self.pool())
        .await?;

        let row = row.ok_or_else(|| Error::ClaimRace(format!("step task {id}")))?;
        record_transition(TaskStatus::Claimed, TaskStatus::Running);
        row.try_into_task()
    }

    async fn complete_task(
        &self,
        id: TaskId,
        worker: &str,
        output: &serde_json::Value,
        duration_ms: u64,
    ) -> Result<bool> {
        validate_transition(TaskStatus::Running, TaskStatus::Completed)?;

        let rows_affected = sqlx::query(
            "UPDATE step_tasks
             SET status = 'completed', result = $1, error = NULL, duration_ms = $2,
                 lease_expires_at = NULL, updated_at = now(), completed_at = now()
             WHERE id = $3 AND status = 'running' AND claimed_by = $4",
        )
        .bind(output)
        .bind(duration_ms as i64)
        .bind(id.0)
        .bind(worker)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 1 {
            record_transition(TaskStatus::Running, TaskStatus::Completed);
        }
        Ok(rows_affected == 1)
    }

    async fn fail_task(&self, id: TaskId, worker: &str, error: &str, duration_ms: u64) -> Result<bool> {
        validate_transition(TaskStatus::Running, TaskStatus::Failed)?;

        let rows_affected = sqlx::query(
            "UPDATE step_tasks
             SET status = 'failed', failures = failures + 1, error = $1, duration_ms = $2,
                 updated_at = now()
             WHERE id = $3 AND status = 'running' AND claimed_by = $4",
        )
        .bind(error)
        .bind(duration_ms as i64)
        .bind(id.0)
        .bind(worker)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 1 {
            record_transition(TaskStatus::Running, TaskStatus::Failed);
        }
        Ok(rows_affected == 1)
    }

    async fn requeue_task(&self, id: TaskId, worker: &str, old_msg_id: i64, delay: Duration) -> Result<bool> {
        validate_transition(TaskStatus::Failed, TaskStatus::Queued)?;
        let mut tx = self.pool().begin().await?;

        let held: Option<(Uuid, String, String)> = sqlx::query_as(
            "SELECT run_id, step_id, queue_name FROM step_tasks
             WHERE id = $1 AND status = 'failed' AND claimed_by = $2
             FOR UPDATE",
        )
        .bind(id.0)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((run_id, step_id, queue)) = held else {
            return Ok(false);
        };

        let envelope = TaskEnvelope {
            run_id: RunId(run_id),
            task_id: id,
            step_id,
        };
        let msg_id = dispatch_on(&mut *tx, &queue, &envelope, delay).await?;
        delete_on(&mut *tx, &queue, old_msg_id).await?;

        sqlx::query(
            "UPDATE step_tasks
             SET status = 'queued', msg_id = $1, claimed_by = NULL, lease_expires_at = NULL,
                 updated_at = now()
             WHERE id = $2",
        )
        .bind(msg_id)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_transition(TaskStatus::Failed, TaskStatus::Queued);
        Ok(true)
    }

    async fn dead_letter_task(
        &self,
        id: TaskId,
        worker: &str,
        msg_id: i64,
        degraded: bool,
        reason: &str,
    ) -> Result<bool> {
        validate_transition(TaskStatus::Failed, TaskStatus::DeadLetter)?;
        let mut tx = self.pool().begin().await?;

        let held: Option<(Uuid, String, String)> = sqlx::query_as(
            "UPDATE step_tasks
             SET status = 'dead_letter', degraded = $1, msg_id = NULL, lease_expires_at = NULL,
                 updated_at = now(), completed_at = now()
             WHERE id = $2 AND status = 'failed' AND claimed_by = $3
             RETURNING run_id, step_id, queue_name",
        )
        .bind(degraded)
        .bind(id.0)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((run_id, step_id, queue)) = held else {
            return Ok(false);
        };

        let envelope = TaskEnvelope {
            run_id: RunId(run_id),
            task_id: id,
            step_id,
        };
        let entry = dead_letter_entry(&queue, msg_id, &envelope.to_json(), reason);
        send_on(&mut *tx, &dead_letter_queue(&queue), &entry, Duration::ZERO).await?;
        delete_on(&mut *tx, &queue, msg_id).await?;

        tx.commit().await?;
        record_transition(TaskStatus::Failed, TaskStatus::DeadLetter);
        metrics::dead_letters().add(
            1,
            &[
                KeyValue::new("queue", queue),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
        Ok(true)
    }

    async fn enqueue_task(&self, id: TaskId) -> Result<bool> {
        validate_transition(TaskStatus::Blocked, TaskStatus::Queued)?;
        let mut tx = self.pool().begin().await?;

        // The status predicate makes concurrent enqueues of one step
        // race on the row lock; exactly one sees `blocked`.
        let blocked: Option<(Uuid, String, String)> = sqlx::query_as(
            "SELECT run_id, step_id, queue_name FROM step_tasks
             WHERE id = $1 AND status = 'blocked'
             FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((run_id, step_id, queue)) = blocked else {
            return Ok(false);
        };

        let envelope = TaskEnvelope {
            run_id: RunId(run_id),
            task_id: id,
            step_id,
        };
        let msg_id = dispatch_on(&mut *tx, &queue, &envelope, Duration::ZERO).await?;
        sqlx::query(
            "UPDATE step_tasks SET status = 'queued', msg_id = $1, updated_at = now() WHERE id = $2",
        )
        .bind(msg_id)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_transition(TaskStatus::Blocked, TaskStatus::Queued);
        Ok(true)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workflow_id: Uuid,
    workflow_name: String,
    version: String,
    input: serde_json::Value,
    status: String,
    attempt: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn try_into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            version: self.version,
            input: self.input,
            status: self.status.parse()?,
            attempt: self.attempt.max(0) as u32,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    run_id: Uuid,
    step_id: String,
    queue_name: String,
    status: String,
    attempt: i32,
    failures: i32,
    degraded: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
    claimed_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    msg_id: Option<i64>,
    duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<StepTask> {
        Ok(StepTask {
            id: TaskId(self.id),
            run_id: RunId(self.run_id),
            step_id: self.step_id,
            queue_name: self.queue_name,
            status: self.status.parse()?,
            attempt: self.attempt.max(0) as u32,
            failures: self.failures.max(0) as u32,
            degraded: self.degraded,
            result: self.result,
            error: self.error,
            claimed_by: self.claimed_by,
            lease_expires_at: self.lease_expires_at,
            msg_id: self.msg_id,
            duration_ms: self.duration_ms.map(|ms| ms.max(0) as u64),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
