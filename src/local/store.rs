//! Run store for the in-process backend.
//!
//! Every operation runs under the backend's single lock, which makes each
//! one atomic, including the queue writes that accompany a transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::{LocalBackend, State};
use crate::error::{Error, Result};
use crate::model::*;
use crate::notify::channel_for;
use crate::queue::{dead_letter_entry, dead_letter_queue};
use crate::store::{NewRun, RunStore};

impl State {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut StepTask> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("step task {id}")))
    }

    /// Held by `worker` in status `status`.
    fn held_by(&self, id: TaskId, worker: &str, status: TaskStatus) -> bool {
        self.tasks
            .get(&id)
            .is_some_and(|t| t.status == status && t.claimed_by.as_deref() == Some(worker))
    }
}

impl LocalBackend {
    /// Send a task's envelope and signal its queue.
    fn dispatch(
        &self,
        state: &mut State,
        task: &StepTask,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<i64> {
        let msg_id = state.send(&task.queue_name, &task.envelope().to_json(), now, delay)?;
        if delay.is_zero() {
            self.publish(&channel_for(&task.queue_name), &task.queue_name);
        }
        Ok(msg_id)
    }
}

#[async_trait]
impl RunStore for LocalBackend {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn register_definition(&self, def: &WorkflowDefinition) -> Result<RegisteredDefinition> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .definitions
            .iter()
            .find(|r| r.definition.name == def.name && r.definition.version == def.version)
        {
            return if existing.definition == *def {
                Ok(existing.clone())
            } else {
                Err(Error::VersionConflict {
                    name: def.name.clone(),
                    version: def.version.clone(),
                })
            };
        }

        let registered = RegisteredDefinition {
            id: Uuid::new_v4(),
            definition: def.clone(),
            registered_at: self.clock.now(),
        };
        state.definitions.push(registered.clone());
        Ok(registered)
    }

    async fn get_definition(&self, r: &DefinitionRef) -> Result<RegisteredDefinition> {
        let state = self.state.lock().await;
        // Newest first, so a bare name resolves to the latest registration
        let mut all = state.definitions.iter().rev();
        let found = match r {
            DefinitionRef::Id(id) => all.find(|d| d.id == *id),
            DefinitionRef::Name(name) => all.find(|d| d.definition.name == *name),
            DefinitionRef::Version { name, version } => {
                all.find(|d| d.definition.name == *name && d.definition.version == *version)
            }
        };
        found
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow definition {r}")))
    }

    async fn list_definitions(&self) -> Result<Vec<RegisteredDefinition>> {
        Ok(self.state.lock().await.definitions.clone())
    }

    async fn create_run(&self, new: NewRun) -> Result<Run> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        for task in &new.tasks {
            if !state.queues.contains_key(&task.queue_name) {
                return Err(Error::NotFound(format!("queue {}", task.queue_name)));
            }
        }

        let run = Run {
            id: new.id,
            workflow_id: new.workflow_id,
            workflow_name: new.workflow_name,
            version: new.version,
            input: new.input,
            status: RunStatus::Pending,
            attempt: 1,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut ids = Vec::with_capacity(new.tasks.len());
        for t in new.tasks {
            let mut task = StepTask {
                id: t.id,
                run_id: run.id,
                step_id: t.step_id,
                queue_name: t.queue_name,
                status: t.status,
                attempt: 0,
                failures: 0,
                degraded: false,
                result: None,
                error: None,
                claimed_by: None,
                lease_expires_at: None,
                msg_id: None,
                duration_ms: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            if task.status == TaskStatus::Queued {
                task.msg_id = Some(self.dispatch(&mut state, &task, now, Duration::ZERO)?);
            }
            ids.push(task.id);
            state.tasks.insert(task.id, task);
        }

        state.run_tasks.insert(run.id, ids);
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        self.state
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    async fn list_runs(&self, workflow: &str, limit: i64) -> Result<Vec<Run>> {
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.workflow_name == workflow)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn get_task(&self, id: TaskId) -> Result<StepTask> {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("step task {id}")))
    }

    async fn list_tasks(&self, run: RunId) -> Result<Vec<StepTask>> {
        let state = self.state.lock().await;
        let ids = state
            .run_tasks
            .get(&run)
            .ok_or_else(|| Error::NotFound(format!("run {run}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn mark_run_running(&self, id: RunId) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                run.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("run {id}"))),
        }
    }

    async fn finish_run(&self, id: RunId, status: RunStatus, error: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: "running".to_string(),
                to: status.to_string(),
            });
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("run {id}")))?;
        if !run.status.can_transition_to(status) {
            return Ok(false);
        }
        run.status = status;
        run.error = error.map(str::to_string);
        run.updated_at = now;
        run.completed_at = Some(now);
        Ok(true)
    }

    async fn reset_run(&self, id: RunId, roots: &[String]) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("run {id}")))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.attempt += 1;
        run.error = None;
        run.updated_at = now;

        let ids = state.run_tasks.get(&id).cloned().unwrap_or_default();
        for task_id in ids {
            let Some(mut task) = state.tasks.remove(&task_id) else {
                continue;
            };
            if let Some(msg_id) = task.msg_id.take() {
                state.delete(&task.queue_name, msg_id);
            }
            task.status = TaskStatus::Blocked;
            task.attempt = 0;
            task.failures = 0;
            task.degraded = false;
            task.result = None;
            task.error = None;
            task.claimed_by = None;
            task.lease_expires_at = None;
            task.duration_ms = None;
            task.completed_at = None;
            task.updated_at = now;
            if roots.contains(&task.step_id) {
                task.msg_id = Some(self.dispatch(&mut state, &task, now, Duration::ZERO)?);
                task.status = TaskStatus::Queued;
            }
            state.tasks.insert(task_id, task);
        }
        Ok(true)
    }

    async fn claim_task(
        &self,
        id: TaskId,
        worker: &str,
        msg_id: i64,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<StepTask>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };

        let claimable = match task.status {
            TaskStatus::Queued => true,
            s if s.is_leased() => !task.lease_valid_at(now),
            _ => false,
        };
        if !claimable || task.msg_id != Some(msg_id) {
            return Ok(None);
        }
        validate_transition(task.status, TaskStatus::Claimed)?;

        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(worker.to_string());
        task.lease_expires_at = Some(lease_expires_at);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn start_task(&self, id: TaskId, worker: &str) -> Result<StepTask> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.held_by(id, worker, TaskStatus::Claimed) {
            return Err(Error::ClaimRace(format!("step task {id}")));
        }
        let task = state.task_mut(id)?;
        task.status = TaskStatus::Running;
        task.attempt += 1;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn complete_task(
        &self,
        id: TaskId,
        worker: &str,
        output: &serde_json::Value,
        duration_ms: u64,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.held_by(id, worker, TaskStatus::Running) {
            return Ok(false);
        }
        let task = state.task_mut(id)?;
        task.status = TaskStatus::Completed;
        task.result = Some(output.clone());
        task.error = None;
        task.duration_ms = Some(duration_ms);
        task.lease_expires_at = None;
        task.updated_at = now;
        task.completed_at = Some(now);
        Ok(true)
    }

    async fn fail_task(&self, id: TaskId, worker: &str, error: &str, duration_ms: u64) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.held_by(id, worker, TaskStatus::Running) {
            return Ok(false);
        }
        let task = state.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.failures += 1;
        task.error = Some(error.to_string());
        task.duration_ms = Some(duration_ms);
        task.updated_at = now;
        Ok(true)
    }

    async fn requeue_task(&self, id: TaskId, worker: &str, old_msg_id: i64, delay: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.held_by(id, worker, TaskStatus::Failed) {
            return Ok(false);
        }
        let snapshot = state.task_mut(id)?.clone();
        let msg_id = self.dispatch(&mut state, &snapshot, now, delay)?;
        state.delete(&snapshot.queue_name, old_msg_id);

        let task = state.task_mut(id)?;
        task.status = TaskStatus::Queued;
        task.msg_id = Some(msg_id);
        task.claimed_by = None;
        task.lease_expires_at = None;
        task.updated_at = now;
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
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.held_by(id, worker, TaskStatus::Failed) {
            return Ok(false);
        }
        let snapshot = state.task_mut(id)?.clone();
        let entry = dead_letter_entry(
            &snapshot.queue_name,
            msg_id,
            &snapshot.envelope().to_json(),
            reason,
        );
        state.send(
            &dead_letter_queue(&snapshot.queue_name),
            &entry,
            now,
            Duration::ZERO,
        )?;
        state.delete(&snapshot.queue_name, msg_id);

        let task = state.task_mut(id)?;
        task.status = TaskStatus::DeadLetter;
        task.degraded = degraded;
        task.msg_id = None;
        task.lease_expires_at = None;
        task.updated_at = now;
        task.completed_at = Some(now);
        Ok(true)
    }

    async fn enqueue_task(&self, id: TaskId) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let snapshot = state.task_mut(id)?.clone();
        if snapshot.status != TaskStatus::Blocked {
            return Ok(false);
        }
        let msg_id = self.dispatch(&mut state, &snapshot, now, Duration::ZERO)?;

        let task = state.task_mut(id)?;
        task.status = TaskStatus::Queued;
        task.msg_id = Some(msg_id);
        task.updated_at = now;
        Ok(true)
    }
}
