//! Runs and step tasks.
//!
//! A run is one execution of a definition against an input payload. Each
//! step of the definition gets one step task per run, the unit of scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Completed)  // finished before the submitter flipped it
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Running) // retry_run restarts in place
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Other(format!("unknown run status: {other}"))),
        }
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub version: String,
    pub input: serde_json::Value,
    pub status: RunStatus,
    /// Whole-run attempts; bumped by the `retry_run` error action.
    pub attempt: u32,
    /// Why the run failed, naming the failing step.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Blocked,
    /// A queue message exists; waiting for a worker.
    Queued,
    /// Worker holds the lease, execution starting.
    Claimed,
    /// Handler executing.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Attempt failed; retry or dead-letter decision pending.
    Failed,
    /// Exhausted attempts or fatally failed. Terminal.
    DeadLetter,
}

impl TaskStatus {
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Blocked, Queued)
                | (Queued, Claimed)
                | (Claimed, Running)
                | (Claimed, Claimed)   // reclaimed after lease expiry
                | (Running, Claimed)
                | (Failed, Claimed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Queued)     // retry
                | (Failed, DeadLetter) // exhausted retries
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }

    /// Held by a worker under a lease.
    pub fn is_leased(self) -> bool {
        matches!(
            self,
            TaskStatus::Claimed | TaskStatus::Running | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(TaskStatus::Blocked),
            "queued" => Ok(TaskStatus::Queued),
            "claimed" => Ok(TaskStatus::Claimed),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

/// Validate a state transition, returning an error if disallowed.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> crate::error::Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// The per-run, per-step unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTask {
    pub id: TaskId,
    pub run_id: RunId,
    pub step_id: String,
    pub queue_name: String,
    pub status: TaskStatus,
    /// Attempts started so far.
    pub attempt: u32,
    /// Attempts that failed.
    pub failures: u32,
    /// Dead-lettered under a `continue` error action.
    pub degraded: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Id of the queue message currently carrying this task.
    pub msg_id: Option<i64>,
    /// Duration of the last finished attempt.
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepTask {
    /// Counts as done for dependency gating and run completion.
    pub fn is_satisfied(&self) -> bool {
        self.status == TaskStatus::Completed
            || (self.status == TaskStatus::DeadLetter && self.degraded)
    }

    /// Lease is held and not yet expired at `now`.
    pub fn lease_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expires_at.is_some_and(|t| t > now)
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            run_id: self.run_id,
            task_id: self.id,
            step_id: self.step_id.clone(),
        }
    }
}

/// Queue payload carrying a step task to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub step_id: String,
}

impl TaskEnvelope {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.0,
            "task_id": self.task_id.0,
            "step_id": self.step_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshots and metrics
// ---------------------------------------------------------------------------

/// Latest persisted state of a run, for callers and operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_name: String,
    pub version: String,
    pub status: RunStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub degraded: bool,
    pub result: Option<serde_json::Value>,
}

impl RunSnapshot {
    pub fn new(run: &Run, tasks: &[StepTask]) -> Self {
        Self {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            version: run.version.clone(),
            status: run.status,
            attempt: run.attempt,
            error: run.error.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
            steps: tasks
                .iter()
                .map(|t| StepSnapshot {
                    id: t.step_id.clone(),
                    status: t.status,
                    attempt: t.attempt,
                    error: t.error.clone(),
                    degraded: t.degraded,
                    result: t.result.clone(),
                })
                .collect(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps currently failed or dead-lettered.
    pub fn failing_steps(&self) -> Vec<&StepSnapshot> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, TaskStatus::Failed | TaskStatus::DeadLetter))
            .collect()
    }
}

/// Derived execution metrics for a run or a whole workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Wall time from creation to completion (or to `now` while in flight).
    pub execution_time_ms: u64,
    /// Successful attempts over all attempts.
    pub success_rate: f64,
    /// Failed attempts over all attempts.
    pub error_rate: f64,
    /// Completed steps per second of execution time.
    pub throughput: f64,
    pub steps_completed: u64,
    pub attempts: u64,
    pub failures: u64,
}

impl RunMetrics {
    pub fn from_run(run: &Run, tasks: &[StepTask], now: DateTime<Utc>) -> Self {
        let end = run.completed_at.unwrap_or(now);
        let execution_time_ms = (end - run.created_at).num_milliseconds().max(0) as u64;
        let steps_completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as u64;
        let attempts = tasks.iter().map(|t| t.attempt as u64).sum();
        let failures = tasks.iter().map(|t| t.failures as u64).sum();
        Self::from_totals(execution_time_ms, steps_completed, attempts, failures)
    }

    /// Sum several runs into one workflow-level figure.
    pub fn aggregate<'a>(runs: impl IntoIterator<Item = &'a RunMetrics>) -> Self {
        let (mut time, mut completed, mut attempts, mut failures) = (0u64, 0u64, 0u64, 0u64);
        for m in runs {
            time += m.execution_time_ms;
            completed += m.steps_completed;
            attempts += m.attempts;
            failures += m.failures;
        }
        Self::from_totals(time, completed, attempts, failures)
    }

    fn from_totals(execution_time_ms: u64, steps_completed: u64, attempts: u64, failures: u64) -> Self {
        let (success_rate, error_rate) = if attempts == 0 {
            (0.0, 0.0)
        } else {
            // In-flight attempts count toward neither rate.
            let successes = steps_completed.min(attempts);
            (
                successes as f64 / attempts as f64,
                failures as f64 / attempts as f64,
            )
        };
        let throughput = if execution_time_ms == 0 {
            steps_completed as f64
        } else {
            steps_completed as f64 / (execution_time_ms as f64 / 1000.0)
        };
        Self {
            execution_time_ms,
            success_rate,
            error_rate,
            throughput,
            steps_completed,
            attempts,
            failures,
        }
    }
}
