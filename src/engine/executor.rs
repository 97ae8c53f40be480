//! Executor: listens for step messages, runs handlers, retires tasks.
//!
//! Each worker blocks on a notification subscription for the queues it
//! serves and polls them on a bounded interval as a safety net. A claimed
//! message is resolved to its step task, the task is leased and started,
//! the handler runs under its deadline, and the outcome either unlocks
//! dependents, schedules a retry, or dead-letters the task and applies the
//! workflow's error handlers.

use opentelemetry::KeyValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

use super::handler::{StepContext, StepError, StepHandler};
use super::{Engine, LoadedDefinition, QueueRoute};
use crate::error::{Error, Result};
use crate::model::*;
use crate::notify::{Notification, Subscription, channel_for};
use crate::queue::QueueMessage;
use crate::telemetry::metrics;
use crate::telemetry::step::{record_state_transition, start_step_span};

/// Slack added to a step's deadline when sizing its queue lease, so the
/// lease outlives every attempt the executor is still waiting on.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Configuration for an executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Prefix of the worker ids recorded as `claimed_by`.
    pub worker_id: String,
    /// Worker loops run concurrently.
    pub workers: usize,
    /// Minimum lease on a claimed message. Raised per queue to cover the
    /// step's deadline.
    pub lease: Duration,
    /// Poll interval fallback when no notification arrives.
    pub poll_interval: Duration,
    /// Messages claimed per read.
    pub batch_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            workers: 4,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            batch_size: 1,
        }
    }
}

/// A pool of workers serving every queue of the engine that has a bound
/// handler.
#[derive(Clone)]
pub struct Executor {
    engine: Engine,
    config: ExecutorConfig,
    shutdown: CancellationToken,
}

impl Executor {
    pub(crate) fn new(engine: Engine, config: ExecutorConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Signal every worker to stop after its current message.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown. Handlers receive child tokens.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the workers on the current runtime.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Run the worker loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        match self.engine.refresh().await {
            Ok(count) => debug!(definitions = count, "definitions loaded"),
            Err(e) => warn!("could not load registered definitions: {e}"),
        }

        let mut workers = JoinSet::new();
        for n in 0..self.config.workers.max(1) {
            let worker = self.worker(format!("{}-{n}", self.config.worker_id));
            workers.spawn(async move { worker.run().await });
        }
        info!(
            worker_id = %self.config.worker_id,
            workers = self.config.workers.max(1),
            "executor started"
        );

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("worker stopped with error: {e}"),
                Err(e) => error!("worker panicked: {e}"),
            }
        }
        info!(worker_id = %self.config.worker_id, "executor stopped");
        Ok(())
    }

    /// Claim and process whatever is available on every served queue, once,
    /// without waiting. Returns the number of messages claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let worker = self.worker(self.config.worker_id.clone());
        Ok(worker.poll_all(&self.engine.served_queues()).await)
    }

    fn worker(&self, id: String) -> Worker {
        Worker {
            engine: self.engine.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            id,
        }
    }
}

/// Outcome of one handler invocation.
type Attempt = std::result::Result<serde_json::Value, (FailureKind, String)>;

/// What a worker knows about the message it is processing.
struct Claimed<'a> {
    queue: &'a str,
    msg_id: i64,
    run: Run,
    loaded: Arc<LoadedDefinition>,
    task: StepTask,
    span: Span,
}

struct Worker {
    engine: Engine,
    config: ExecutorConfig,
    shutdown: CancellationToken,
    id: String,
}

impl Worker {
    async fn run(&self) -> Result<()> {
        let backend = Arc::clone(self.engine.backend());
        let mut subscription = match backend.subscribe().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(worker = %self.id, "notification subscribe failed: {e}, polling only");
                None
            }
        };
        let mut listening: HashSet<String> = HashSet::new();

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let queues = self.engine.served_queues();
            if let Some(sub) = subscription.as_mut() {
                for queue in &queues {
                    if listening.contains(queue) {
                        continue;
                    }
                    match sub.listen(&channel_for(queue)).await {
                        Ok(()) => {
                            listening.insert(queue.clone());
                        }
                        Err(e) => warn!(worker = %self.id, queue, "listen failed: {e}"),
                    }
                }
            }

            // Drain eagerly while there is work
            if self.poll_all(&queues).await > 0 {
                continue;
            }

            // Wait for: shutdown, notification, or poll timeout
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker = %self.id, "worker shutting down");
                    return Ok(());
                }
                signal = next_signal(subscription.as_mut()) => {
                    match signal {
                        Ok(n) => debug!(worker = %self.id, queue = %n.payload, "notified of new step"),
                        Err(e) => {
                            warn!(worker = %self.id, "subscription error: {e}, falling back to poll");
                            tokio::time::sleep(self.config.poll_interval).await;
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn poll_all(&self, queues: &[String]) -> usize {
        let mut claimed = 0;
        for queue in queues {
            match self.poll_queue(queue).await {
                Ok(n) => claimed += n,
                Err(e) => error!(worker = %self.id, queue, "poll failed: {e}"),
            }
        }
        claimed
    }

    async fn poll_queue(&self, queue: &str) -> Result<usize> {
        let Some(route) = self.engine.route(queue) else {
            return Ok(0);
        };
        let lease = self.config.lease.max(route.timeout + LEASE_MARGIN);
        let messages = self
            .engine
            .backend()
            .read_capped(queue, lease, self.config.batch_size.max(1), route.concurrency)
            .await?;

        let claimed = messages.len();
        for msg in messages {
            let msg_id = msg.msg_id;
            match self.process_message(queue, &route, msg).await {
                Ok(()) => {}
                Err(Error::ClaimRace(what)) => debug!(queue, msg_id, "lost claim on {what}"),
                Err(e) => error!(queue, msg_id, "processing failed: {e}"),
            }
        }
        Ok(claimed)
    }

    async fn process_message(&self, queue: &str, route: &QueueRoute, msg: QueueMessage) -> Result<()> {
        let backend = self.engine.backend();

        let envelope: TaskEnvelope = match serde_json::from_value(msg.message.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue, msg_id = msg.msg_id, "malformed step message: {e}");
                backend
                    .move_to_dead_letter(queue, &msg, "malformed payload")
                    .await?;
                metrics::dead_letters().add(
                    1,
                    &[
                        KeyValue::new("queue", queue.to_string()),
                        KeyValue::new("reason", "malformed payload"),
                    ],
                );
                return Ok(());
            }
        };

        let run = match backend.get_run(envelope.run_id).await {
            Ok(run) => run,
            Err(Error::NotFound(_)) => {
                warn!(queue, msg_id = msg.msg_id, run_id = %envelope.run_id, "message for unknown run, deleting");
                backend.delete(queue, msg.msg_id).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if run.status.is_terminal() {
            debug!(queue, msg_id = msg.msg_id, run_id = %run.id, "run already finished, deleting message");
            backend.delete(queue, msg.msg_id).await?;
            return Ok(());
        }

        let Some(handler) =
            self.engine
                .handlers()
                .resolve(&run.workflow_name, &run.version, &envelope.step_id)
        else {
            // Left for lease expiry; another worker may serve this version
            metrics::steps_unroutable().add(1, &[KeyValue::new("queue", queue.to_string())]);
            warn!(
                queue,
                workflow = %route.workflow,
                version = %run.version,
                step = %envelope.step_id,
                "no handler bound for step"
            );
            return Ok(());
        };

        let loaded = self
            .engine
            .definition(&run.workflow_name, &run.version)
            .await?;

        // The read lease follows the newest version's route; a run pinned to
        // an older version may need longer.
        let needed = step_timeout(&loaded.definition, &envelope.step_id) + LEASE_MARGIN;
        let mut lease_until = msg.vt;
        if lease_until < backend.now() + chrono_delta(needed) {
            match backend.set_lease(queue, msg.msg_id, needed).await? {
                Some(extended) => lease_until = extended.vt,
                None => return Ok(()),
            }
        }

        let Some(task) = backend
            .claim_task(envelope.task_id, &self.id, msg.msg_id, lease_until)
            .await?
        else {
            return self
                .discard_if_stale(queue, run.id, &loaded, envelope.task_id, msg.msg_id)
                .await;
        };
        let task = backend.start_task(task.id, &self.id).await?;

        let span = start_step_span(
            &run.workflow_name,
            &task.step_id,
            run.id,
            task.id,
            task.attempt,
        );
        record_state_transition(&span, "claimed", "running");

        let claimed = Claimed {
            queue,
            msg_id: msg.msg_id,
            run,
            loaded,
            task,
            span: span.clone(),
        };
        self.execute(claimed, handler).instrument(span).await
    }

    /// A claim failed: drop the message if nothing will ever claim the task
    /// through it. A satisfied task's own message coming back means its
    /// worker stopped before propagating, so propagate first.
    async fn discard_if_stale(
        &self,
        queue: &str,
        run_id: RunId,
        loaded: &LoadedDefinition,
        task_id: TaskId,
        msg_id: i64,
    ) -> Result<()> {
        let backend = self.engine.backend();
        match backend.get_task(task_id).await {
            Ok(task) if task.is_satisfied() && task.msg_id == Some(msg_id) => {
                info!(queue, msg_id, task_id = %task_id, step = %task.step_id, "resuming propagation of finished step");
                self.propagate(run_id, loaded, &task.step_id).await?;
                backend.delete(queue, msg_id).await?;
            }
            Ok(task) if task.status.is_terminal() || task.msg_id != Some(msg_id) => {
                debug!(queue, msg_id, task_id = %task_id, status = %task.status, "stale message, deleting");
                backend.delete(queue, msg_id).await?;
            }
            Ok(task) => {
                debug!(queue, msg_id, task_id = %task_id, status = %task.status, "task leased elsewhere");
            }
            Err(Error::NotFound(_)) => {
                backend.delete(queue, msg_id).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn execute(&self, claimed: Claimed<'_>, handler: Arc<dyn StepHandler>) -> Result<()> {
        let backend = self.engine.backend();
        let def = &claimed.loaded.definition;

        let outputs: BTreeMap<String, serde_json::Value> = backend
            .list_tasks(claimed.run.id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.result.map(|r| (t.step_id, r)))
            .collect();

        let timeout = step_timeout(def, &claimed.task.step_id);
        let cancel = self.shutdown.child_token();
        let ctx = StepContext {
            run_id: claimed.run.id,
            workflow: claimed.run.workflow_name.clone(),
            version: claimed.run.version.clone(),
            step_id: claimed.task.step_id.clone(),
            attempt: claimed.task.attempt,
            input: claimed.run.input.clone(),
            outputs,
            cancel: cancel.clone(),
        };

        let started = tokio::time::Instant::now();
        let attempt = invoke(handler, ctx, timeout, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match &attempt {
            Ok(_) => "ok".to_string(),
            Err((kind, _)) => kind.to_string(),
        };
        metrics::step_executions().add(
            1,
            &[
                KeyValue::new("workflow", claimed.run.workflow_name.clone()),
                KeyValue::new("step", claimed.task.step_id.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
        metrics::operation_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("operation", "step.execute")],
        );

        match attempt {
            Ok(output) => self.on_success(&claimed, &output, duration_ms).await,
            Err((kind, error)) => self.on_failure(&claimed, kind, &error, duration_ms).await,
        }
    }

    async fn on_success(
        &self,
        claimed: &Claimed<'_>,
        output: &serde_json::Value,
        duration_ms: u64,
    ) -> Result<()> {
        let backend = self.engine.backend();
        let task = &claimed.task;

        // Record, propagate, then ack. The message outlives any crash or
        // error before the ack and its redelivery resumes propagation.
        if !backend
            .complete_task(task.id, &self.id, output, duration_ms)
            .await?
        {
            warn!(task_id = %task.id, "lease lost before completion, result dropped");
            return Ok(());
        }
        record_state_transition(&claimed.span, "running", "completed");
        info!(duration_ms, attempt = task.attempt, "step completed");

        self.propagate(claimed.run.id, &claimed.loaded, &task.step_id)
            .await?;
        backend.delete(claimed.queue, claimed.msg_id).await?;
        Ok(())
    }

    async fn on_failure(
        &self,
        claimed: &Claimed<'_>,
        kind: FailureKind,
        error: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let backend = self.engine.backend();
        let task = &claimed.task;
        let def = &claimed.loaded.definition;

        if !backend
            .fail_task(task.id, &self.id, error, duration_ms)
            .await?
        {
            warn!(task_id = %task.id, "lease lost before failure was recorded");
            return Ok(());
        }
        record_state_transition(&claimed.span, "running", "failed");

        let handler = def.error_handler_for(kind);
        let default_attempts = def.config.retries + 1;
        let max_attempts = match handler {
            Some(h) if h.action != ErrorAction::RetryRun => {
                h.max_attempts.unwrap_or(default_attempts)
            }
            _ => default_attempts,
        };

        if kind != FailureKind::Fatal && task.attempt < max_attempts {
            let backoff = handler.and_then(|h| h.backoff).unwrap_or_default();
            let delay = backoff.delay(Duration::from_millis(def.config.retry_delay_ms), task.attempt);
            if backend
                .requeue_task(task.id, &self.id, claimed.msg_id, delay)
                .await?
            {
                record_state_transition(&claimed.span, "failed", "queued");
                warn!(
                    attempt = task.attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %kind,
                    error,
                    "step failed, retry scheduled"
                );
            }
            return Ok(());
        }

        let action = handler.map(|h| h.action).unwrap_or(ErrorAction::FailRun);
        let reason = format!("{kind}: {error}");
        if !backend
            .dead_letter_task(
                task.id,
                &self.id,
                claimed.msg_id,
                action == ErrorAction::Continue,
                &reason,
            )
            .await?
        {
            return Ok(());
        }
        record_state_transition(&claimed.span, "failed", "dead_letter");
        error!(attempt = task.attempt, ?action, %reason, "step dead-lettered");

        let run_id = claimed.run.id;
        match action {
            ErrorAction::FailRun => {
                let message = format!("step {} failed: {reason}", task.step_id);
                self.finish(run_id, &claimed.loaded, RunStatus::Failed, Some(&message))
                    .await
            }
            ErrorAction::Continue => {
                self.propagate(run_id, &claimed.loaded, &task.step_id)
                    .await
            }
            ErrorAction::RetryRun => {
                let limit = handler
                    .and_then(|h| h.max_attempts)
                    .unwrap_or(default_attempts);
                let current = backend.get_run(run_id).await?;
                if current.attempt < limit {
                    if backend.reset_run(run_id, claimed.loaded.graph.roots()).await? {
                        warn!(
                            run_id = %run_id,
                            run_attempt = current.attempt + 1,
                            limit,
                            "restarting run"
                        );
                    }
                    Ok(())
                } else {
                    let message = format!(
                        "step {} failed after {} run attempts: {reason}",
                        task.step_id, current.attempt
                    );
                    self.finish(run_id, &claimed.loaded, RunStatus::Failed, Some(&message))
                        .await
                }
            }
        }
    }

    /// Re-check every dependent of `step` and enqueue those whose
    /// dependencies are all satisfied, then complete the run if nothing is
    /// left.
    async fn propagate(&self, run_id: RunId, loaded: &LoadedDefinition, step: &str) -> Result<()> {
        let backend = self.engine.backend();
        let tasks = backend.list_tasks(run_id).await?;
        let by_step: HashMap<&str, &StepTask> =
            tasks.iter().map(|t| (t.step_id.as_str(), t)).collect();

        for dependent in loaded.graph.dependents(step) {
            let ready = loaded
                .graph
                .dependencies(dependent)
                .iter()
                .all(|d| by_step.get(d.as_str()).is_some_and(|t| t.is_satisfied()));
            if !ready {
                continue;
            }
            let Some(task) = by_step.get(dependent.as_str()) else {
                continue;
            };
            if task.status == TaskStatus::Blocked && backend.enqueue_task(task.id).await? {
                info!(run_id = %run_id, step = %dependent, "dependencies satisfied, step queued");
            }
        }

        if tasks.iter().all(StepTask::is_satisfied) {
            self.finish(run_id, loaded, RunStatus::Completed, None).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        run_id: RunId,
        loaded: &LoadedDefinition,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let def = &loaded.definition;
        if !self
            .engine
            .backend()
            .finish_run(run_id, status, error)
            .await?
        {
            return Ok(());
        }

        metrics::run_completions().add(
            1,
            &[
                KeyValue::new("workflow", def.name.clone()),
                KeyValue::new("status", status.to_string()),
            ],
        );
        match status {
            RunStatus::Completed => info!(run_id = %run_id, workflow = %def.name, "run completed"),
            _ => warn!(run_id = %run_id, workflow = %def.name, error, "run failed"),
        }

        let m = self.engine.metrics(run_id).await?;
        let labels = [KeyValue::new("workflow", def.name.clone())];
        for (metric, value) in [
            (MetricName::ExecutionTime, m.execution_time_ms as f64),
            (MetricName::SuccessRate, m.success_rate),
            (MetricName::ErrorRate, m.error_rate),
            (MetricName::Throughput, m.throughput),
        ] {
            if def.records(metric) {
                metrics::run_metric(metric).record(value, &labels);
            }
        }
        Ok(())
    }
}

fn step_timeout(def: &WorkflowDefinition, step_id: &str) -> Duration {
    def.get_step(step_id)
        .map(|step| def.step_timeout(step))
        .unwrap_or(Duration::from_millis(def.config.timeout_ms))
}

fn chrono_delta(d: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(d).unwrap_or(chrono::TimeDelta::days(365))
}

/// Run a handler on its own task under a deadline. Overrunning cancels the
/// handler's token and aborts it; a panic is an ordinary failure.
async fn invoke(
    handler: Arc<dyn StepHandler>,
    ctx: StepContext,
    timeout: Duration,
    cancel: CancellationToken,
) -> Attempt {
    let mut handle = tokio::spawn(async move { handler.execute(ctx).await });
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(StepError::Retryable(e)))) => Err((FailureKind::Handler, e)),
        Ok(Ok(Err(StepError::Fatal(e)))) => Err((FailureKind::Fatal, e)),
        Ok(Err(join)) => Err((FailureKind::Handler, format!("handler panicked: {join}"))),
        Err(_) => {
            cancel.cancel();
            handle.abort();
            Err((
                FailureKind::Timeout,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

async fn next_signal(subscription: Option<&mut Box<dyn Subscription>>) -> Result<Notification> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
