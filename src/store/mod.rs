//! Persistence contract for definitions, runs and step tasks.
//!
//! Every run or step-task mutation is a single-row conditional update keyed
//! by id. Operations that move a task onto a queue (`create_run`,
//! `enqueue_task`, `requeue_task`, `reset_run`) write the record and the
//! queue message atomically, so a crash never leaves a `queued` task
//! without a message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::notify::NotificationBus;
use crate::queue::Queue;

/// A run to create, with its step tasks in their initial states.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub version: String,
    pub input: serde_json::Value,
    pub tasks: Vec<NewStepTask>,
}

#[derive(Debug, Clone)]
pub struct NewStepTask {
    pub id: TaskId,
    pub step_id: String,
    pub queue_name: String,
    /// `Queued` for roots, `Blocked` otherwise.
    pub status: TaskStatus,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Current time on the store's clock, used for lease and metric
    /// arithmetic.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Store a definition. Re-registering identical content returns the
    /// existing record; different content fails with `VersionConflict`.
    async fn register_definition(&self, def: &WorkflowDefinition) -> Result<RegisteredDefinition>;

    async fn get_definition(&self, r: &DefinitionRef) -> Result<RegisteredDefinition>;

    /// All registered definitions, oldest first.
    async fn list_definitions(&self) -> Result<Vec<RegisteredDefinition>>;

    /// Insert a `pending` run and its tasks; send a message for every
    /// `queued` task.
    async fn create_run(&self, run: NewRun) -> Result<Run>;

    async fn get_run(&self, id: RunId) -> Result<Run>;

    /// Most recent runs of a workflow.
    async fn list_runs(&self, workflow: &str, limit: i64) -> Result<Vec<Run>>;

    async fn get_task(&self, id: TaskId) -> Result<StepTask>;

    /// Tasks of a run, in creation order.
    async fn list_tasks(&self, run: RunId) -> Result<Vec<StepTask>>;

    /// `pending → running`. Returns `false` if the run had already moved on.
    async fn mark_run_running(&self, id: RunId) -> Result<bool>;

    /// Move a non-terminal run to `completed` or `failed`.
    async fn finish_run(&self, id: RunId, status: RunStatus, error: Option<&str>) -> Result<bool>;

    /// Restart a run: bump its attempt, reset every task to its initial
    /// state and enqueue the roots. Returns `false` if the run is terminal.
    async fn reset_run(&self, id: RunId, roots: &[String]) -> Result<bool>;

    /// Take the lease on a task through message `msg_id`: `queued → claimed`,
    /// or re-claim a leased task whose lease has expired. `None` if another
    /// worker holds it, it is terminal, or `msg_id` is not the message
    /// currently carrying it.
    async fn claim_task(
        &self,
        id: TaskId,
        worker: &str,
        msg_id: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<StepTask>>;

    /// `claimed → running`, counting one attempt.
    ///
    /// # Errors
    /// [`crate::error::Error::ClaimRace`] if `worker` no longer holds the claim.
    async fn start_task(&self, id: TaskId, worker: &str) -> Result<StepTask>;

    /// `running → completed` with the handler output.
    async fn complete_task(
        &self,
        id: TaskId,
        worker: &str,
        output: &serde_json::Value,
        duration_ms: u64,
    ) -> Result<bool>;

    /// `running → failed`, counting one failure.
    async fn fail_task(&self, id: TaskId, worker: &str, error: &str, duration_ms: u64) -> Result<bool>;

    /// `failed → queued`: replace message `old_msg_id` with a new one
    /// visible after `delay`.
    async fn requeue_task(&self, id: TaskId, worker: &str, old_msg_id: i64, delay: Duration) -> Result<bool>;

    /// `failed → dead_letter`, moving message `msg_id` to the dead-letter
    /// queue annotated with `reason`. `degraded` marks the task satisfied
    /// for dependents.
    async fn dead_letter_task(
        &self,
        id: TaskId,
        worker: &str,
        msg_id: i64,
        degraded: bool,
        reason: &str,
    ) -> Result<bool>;

    /// `blocked → queued` plus a message and a notification. Idempotent per
    /// `(run_id, step_id)`: only the first caller gets `true`.
    async fn enqueue_task(&self, id: TaskId) -> Result<bool>;
}

/// Everything the engine needs from a storage backend.
pub trait Backend: Queue + NotificationBus + RunStore {}

impl<T: Queue + NotificationBus + RunStore> Backend for T {}
