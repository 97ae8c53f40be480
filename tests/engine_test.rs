//! End-to-end workflow execution on the in-process backend.
//!
//! Runtimes start paused so lease expiry, retry backoff and step deadlines
//! play out on a virtual clock.

use dagq::engine::{Engine, Executor, ExecutorConfig, StepError, StepHandler, handler_fn};
use dagq::local::LocalBackend;
use dagq::model::*;
use dagq::queue::{Queue, dead_letter_queue, queue_name};
use dagq::store::RunStore;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(120);

struct Harness {
    engine: Engine,
    backend: Arc<LocalBackend>,
    executor: Executor,
}

impl Harness {
    fn new() -> Self {
        let backend = Arc::new(LocalBackend::new());
        let engine = Engine::new(backend.clone());
        let executor = engine.executor(ExecutorConfig {
            worker_id: "test".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(10),
            ..ExecutorConfig::default()
        });
        executor.spawn();
        Self {
            engine,
            backend,
            executor,
        }
    }

    async fn run(&self, def: &WorkflowDefinition, input: serde_json::Value) -> RunSnapshot {
        let run_id = self
            .engine
            .submit(&def.name, &def.version, input)
            .await
            .unwrap();
        let snapshot = self.engine.wait_for(run_id, WAIT).await.unwrap();
        assert!(
            snapshot.status.is_terminal(),
            "run did not finish: {snapshot:?}"
        );
        snapshot
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}

fn returns(value: serde_json::Value) -> Arc<dyn StepHandler> {
    handler_fn(move |_ctx| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// Handler that appends its step id to `log` and echoes it.
fn logs_to(log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn StepHandler> {
    let log = Arc::clone(log);
    handler_fn(move |ctx| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(ctx.step_id.clone());
            Ok(json!(ctx.step_id))
        }
    })
}

/// Handler failing with a retryable error on its first `failures` calls.
fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Arc<dyn StepHandler> {
    let calls = Arc::clone(calls);
    handler_fn(move |_ctx| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                Err(StepError::retryable(format!("transient failure {}", n + 1)))
            } else {
                Ok(json!("recovered"))
            }
        }
    })
}

fn single(name: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(name, "1").step(StepDefinition::new("only"))
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sample_etl_completes_in_order() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("sample_etl", "1.0.0")
        .concurrency(2)
        .timeout_ms(5000)
        .retries(3)
        .retry_delay_ms(1000)
        .step(StepDefinition::new("ingest").next(["transform"]))
        .step(
            StepDefinition::new("transform")
                .depends_on(["ingest"])
                .next(["load"]),
        )
        .step(StepDefinition::new("load").depends_on(["transform"]));
    h.engine.register(def.clone()).await.unwrap();

    h.engine.bind(
        "sample_etl",
        "ingest",
        handler_fn(|ctx| async move {
            Ok(json!({"source": ctx.input["source"].clone(), "rows": 21}))
        }),
    );
    h.engine.bind(
        "sample_etl",
        "transform",
        handler_fn(|ctx| async move {
            let rows = ctx
                .output("ingest")
                .and_then(|v| v["rows"].as_u64())
                .ok_or_else(|| StepError::fatal("ingest output missing"))?;
            Ok(json!({"rows": rows * 2}))
        }),
    );
    h.engine.bind("sample_etl", "load", returns(json!("loaded")));

    let snapshot = h.run(&def, json!({"source": "file.csv"})).await;
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.attempt, 1);
    assert_eq!(
        snapshot.step("ingest").unwrap().result,
        Some(json!({"source": "file.csv", "rows": 21}))
    );
    assert_eq!(
        snapshot.step("transform").unwrap().result,
        Some(json!({"rows": 42}))
    );
    assert!(snapshot.steps.iter().all(|s| s.status == TaskStatus::Completed));

    let m = h.engine.metrics(snapshot.run_id).await.unwrap();
    assert_eq!(m.success_rate, 1.0);
    assert_eq!(m.error_rate, 0.0);
    assert_eq!(m.steps_completed, 3);
    assert_eq!(m.attempts, 3);
    assert!(m.throughput > 0.0);

    // Every step message was acknowledged
    for step in ["ingest", "transform", "load"] {
        let stats = h
            .engine
            .backend()
            .stats(&queue_name("sample_etl", step))
            .await
            .unwrap();
        assert_eq!(stats.total, 0, "leftover message on {step}");
    }
}

#[tokio::test(start_paused = true)]
async fn diamond_join_waits_for_both_branches() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("diamond", "1")
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("b").depends_on(["a"]))
        .step(StepDefinition::new("c").depends_on(["a"]))
        .step(StepDefinition::new("d").depends_on(["b", "c"]));
    h.engine.register(def.clone()).await.unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    for step in ["a", "b", "c"] {
        h.engine.bind("diamond", step, logs_to(&log));
    }
    let join_log = Arc::clone(&log);
    h.engine.bind(
        "diamond",
        "d",
        handler_fn(move |ctx| {
            let log = Arc::clone(&join_log);
            async move {
                if ctx.output("b").is_none() || ctx.output("c").is_none() {
                    return Err(StepError::fatal("join ran before its dependencies"));
                }
                log.lock().unwrap().push(ctx.step_id.clone());
                Ok(json!("joined"))
            }
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 4, "each step runs exactly once: {log:?}");
    assert_eq!(log.first().map(String::as_str), Some("a"));
    assert_eq!(log.last().map(String::as_str), Some("d"));
}

#[tokio::test(start_paused = true)]
async fn diamond_branches_run_concurrently() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("parallel_diamond", "1")
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("b").depends_on(["a"]))
        .step(StepDefinition::new("c").depends_on(["a"]))
        .step(StepDefinition::new("d").depends_on(["b", "c"]));
    h.engine.register(def.clone()).await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for step in ["b", "c"] {
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        h.engine.bind(
            "parallel_diamond",
            step,
            handler_fn(move |ctx| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(ctx.step_id))
                }
            }),
        );
    }
    h.engine.bind("parallel_diamond", "a", returns(json!("a")));
    h.engine.bind("parallel_diamond", "d", returns(json!("d")));

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");
    assert_eq!(peak.load(Ordering::SeqCst), 2, "b and c overlap");
}

#[tokio::test(start_paused = true)]
async fn fan_in_step_runs_once_after_all_roots() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("fan_in", "1")
        .concurrency(3)
        .step(StepDefinition::new("x"))
        .step(StepDefinition::new("y"))
        .step(StepDefinition::new("z"))
        .step(StepDefinition::new("merge").depends_on(["x", "y", "z"]));
    h.engine.register(def.clone()).await.unwrap();

    for step in ["x", "y", "z"] {
        h.engine.bind("fan_in", step, returns(json!(step)));
    }
    let merges = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&merges);
    h.engine.bind(
        "fan_in",
        "merge",
        handler_fn(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let seen: Vec<&str> = ["x", "y", "z"]
                    .into_iter()
                    .filter(|s| ctx.output(s).is_some())
                    .collect();
                Ok(json!(seen))
            }
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(merges.load(Ordering::SeqCst), 1);
    assert_eq!(
        snapshot.step("merge").unwrap().result,
        Some(json!(["x", "y", "z"]))
    );
}

#[tokio::test(start_paused = true)]
async fn run_once_processes_available_work_without_workers() {
    let backend = Arc::new(LocalBackend::new());
    let engine = Engine::new(backend);
    let def = single("manual");
    engine.register(def.clone()).await.unwrap();
    engine.bind("manual", "only", returns(json!(1)));

    let executor = engine.executor(ExecutorConfig::default());
    let run_id = engine.submit("manual", "1", json!({})).await.unwrap();
    assert_eq!(executor.run_once().await.unwrap(), 1);

    let snapshot = engine.status(run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(executor.run_once().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Retries and dead letters
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially() {
    let h = Harness::new();
    let def = single("backoff").retries(3).retry_delay_ms(1000);
    h.engine.register(def.clone()).await.unwrap();

    let attempts = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let seen = Arc::clone(&attempts);
    h.engine.bind(
        "backoff",
        "only",
        handler_fn(move |ctx| {
            seen.lock().unwrap().push(Instant::now());
            async move {
                if ctx.attempt < 3 {
                    Err(StepError::retryable("not yet"))
                } else {
                    Ok(json!(ctx.attempt))
                }
            }
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.step("only").unwrap().attempt, 3);

    let at = attempts.lock().unwrap().clone();
    assert_eq!(at.len(), 3);
    let first_gap = at[1] - at[0];
    let second_gap = at[2] - at[1];
    assert!(
        first_gap >= Duration::from_millis(1000) && first_gap < Duration::from_millis(1100),
        "first retry after {first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(2000) && second_gap < Duration::from_millis(2100),
        "second retry after {second_gap:?}"
    );

    let m = h.engine.metrics(snapshot.run_id).await.unwrap();
    assert_eq!(m.attempts, 3);
    assert_eq!(m.failures, 2);
    assert!((m.success_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn exhausted_step_is_dead_lettered_and_fails_run() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("doomed", "1")
        .retries(1)
        .retry_delay_ms(100)
        .step(StepDefinition::new("first"))
        .step(StepDefinition::new("second").depends_on(["first"]));
    h.engine.register(def.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    h.engine.bind("doomed", "first", flaky(u32::MAX, &calls));
    h.engine.bind("doomed", "second", returns(json!("unreachable")));

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert!(snapshot.error.as_deref().unwrap().contains("first"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let first = snapshot.step("first").unwrap();
    assert_eq!(first.status, TaskStatus::DeadLetter);
    assert!(!first.degraded);
    assert_eq!(snapshot.step("second").unwrap().status, TaskStatus::Blocked);

    let queue = queue_name("doomed", "first");
    assert_eq!(h.backend.peek_queue(&queue).await.unwrap().len(), 0);
    let dead = h.backend.peek_queue(&dead_letter_queue(&queue)).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message["original_queue"], json!(queue));
    assert!(dead[0].message["dlq_reason"]
        .as_str()
        .unwrap()
        .starts_with("handler_error"));
    assert_eq!(dead[0].message["payload"]["step_id"], "first");
}

#[tokio::test(start_paused = true)]
async fn fatal_error_skips_retries() {
    let h = Harness::new();
    let def = single("fatal").retries(5);
    h.engine.register(def.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    h.engine.bind(
        "fatal",
        "only",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::fatal("bad input")) }
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(snapshot.error.unwrap().contains("bad input"));
}

#[tokio::test(start_paused = true)]
async fn step_overrunning_its_deadline_times_out() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("slow", "1")
        .retries(0)
        .step(StepDefinition::new("only").timeout_ms(50));
    h.engine.register(def.clone()).await.unwrap();
    h.engine.bind(
        "slow",
        "only",
        handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("too late"))
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Failed);
    let step = snapshot.step("only").unwrap();
    assert_eq!(step.status, TaskStatus::DeadLetter);
    assert!(step.error.as_deref().unwrap().contains("timed out"));
    assert!(snapshot.error.unwrap().contains("timeout"));
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_counts_as_failure() {
    let h = Harness::new();
    let def = single("panics").retries(0);
    h.engine.register(def.clone()).await.unwrap();
    h.engine.bind(
        "panics",
        "only",
        handler_fn(|ctx| async move {
            if ctx.attempt > 0 {
                panic!("handler blew up");
            }
            Ok(json!(null))
        }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert!(snapshot.error.unwrap().contains("panicked"));
}

// ---------------------------------------------------------------------------
// Error handlers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn continue_handler_degrades_and_unblocks_dependents() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("lenient", "1")
        .retries(0)
        .on_error(ErrorHandler::new(ErrorMatch::Any, ErrorAction::Continue))
        .step(StepDefinition::new("optional"))
        .step(StepDefinition::new("report").depends_on(["optional"]));
    h.engine.register(def.clone()).await.unwrap();
    h.engine.bind(
        "lenient",
        "optional",
        handler_fn(|_ctx| async { Err(StepError::retryable("service down")) }),
    );
    h.engine.bind(
        "lenient",
        "report",
        handler_fn(|ctx| async move { Ok(json!({"had_optional": ctx.output("optional").is_some()})) }),
    );

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed);

    let optional = snapshot.step("optional").unwrap();
    assert_eq!(optional.status, TaskStatus::DeadLetter);
    assert!(optional.degraded);
    assert_eq!(
        snapshot.step("report").unwrap().result,
        Some(json!({"had_optional": false}))
    );

    let dlq = dead_letter_queue(&queue_name("lenient", "optional"));
    assert_eq!(h.backend.peek_queue(&dlq).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_max_attempts_overrides_retries() {
    let h = Harness::new();
    let def = single("patient")
        .retries(0)
        .retry_delay_ms(10)
        .on_error(
            ErrorHandler::new(ErrorMatch::HandlerError, ErrorAction::FailRun)
                .max_attempts(4)
                .backoff(Backoff::Fixed),
        );
    h.engine.register(def.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    h.engine.bind("patient", "only", flaky(3, &calls));

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_run_restarts_from_the_roots() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("restart", "1")
        .retries(0)
        .on_error(ErrorHandler::new(ErrorMatch::Any, ErrorAction::RetryRun).max_attempts(2))
        .step(StepDefinition::new("setup"))
        .step(StepDefinition::new("work").depends_on(["setup"]));
    h.engine.register(def.clone()).await.unwrap();

    let setups = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&setups);
    h.engine.bind(
        "restart",
        "setup",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("ready")) }
        }),
    );
    let calls = Arc::new(AtomicU32::new(0));
    h.engine.bind("restart", "work", flaky(1, &calls));

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");
    assert_eq!(snapshot.attempt, 2);
    assert_eq!(setups.load(Ordering::SeqCst), 2, "roots rerun on restart");
    assert_eq!(snapshot.step("work").unwrap().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_run_gives_up_after_its_limit() {
    let h = Harness::new();
    let def = single("hopeless")
        .retries(0)
        .on_error(ErrorHandler::new(ErrorMatch::Any, ErrorAction::RetryRun).max_attempts(2));
    h.engine.register(def.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    h.engine.bind("hopeless", "only", flaky(u32::MAX, &calls));

    let snapshot = h.run(&def, json!({})).await;
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert_eq!(snapshot.attempt, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(snapshot.error.unwrap().contains("after 2 run attempts"));
}

// ---------------------------------------------------------------------------
// Concurrency and metrics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn step_concurrency_caps_parallel_executions() {
    let h = Harness::new();
    let def = WorkflowDefinition::new("capped", "1")
        .concurrency(8)
        .step(StepDefinition::new("only").concurrency(1));
    h.engine.register(def.clone()).await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    h.engine.bind(
        "capped",
        "only",
        handler_fn(move |_ctx| {
            let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }),
    );

    let mut runs = Vec::new();
    for n in 0..3 {
        runs.push(h.engine.submit("capped", "1", json!({"n": n})).await.unwrap());
    }
    for run in runs {
        let snapshot = h.engine.wait_for(run, WAIT).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn workflow_metrics_sum_over_runs() {
    let h = Harness::new();
    let def = single("summed").retries(1).retry_delay_ms(10);
    h.engine.register(def.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    h.engine.bind("summed", "only", flaky(1, &calls));

    h.run(&def, json!({})).await;
    h.run(&def, json!({})).await;

    let m = h.engine.workflow_metrics("summed").await.unwrap();
    assert_eq!(m.steps_completed, 2);
    assert_eq!(m.attempts, 3);
    assert_eq!(m.failures, 1);
    assert!((m.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((m.error_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn unknown_workflow_cannot_be_submitted() {
    let engine = Engine::in_memory();
    let err = engine.submit("ghost", "1", json!({})).await.unwrap_err();
    assert!(matches!(err, dagq::error::Error::NotFound(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Crash recovery and leases
// ---------------------------------------------------------------------------

/// Engine with `def` registered and a run submitted, but no executor yet.
/// The message for `step` is read by a worker that then disappears.
async fn abandoned_step(
    def: &WorkflowDefinition,
    step: &str,
) -> (Engine, Arc<LocalBackend>, RunId, StepTask) {
    let backend = Arc::new(LocalBackend::new());
    let engine = Engine::new(backend.clone());
    engine.register(def.clone()).await.unwrap();
    let run_id = engine.submit(&def.name, &def.version, json!({})).await.unwrap();

    let task = backend
        .list_tasks(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.step_id == step)
        .unwrap();
    let msg = backend
        .read(&queue_name(&def.name, step), Duration::from_secs(2), 1)
        .await
        .unwrap()
        .pop()
        .unwrap();
    backend
        .claim_task(task.id, "crashed", msg.msg_id, msg.vt)
        .await
        .unwrap()
        .unwrap();
    let task = backend.start_task(task.id, "crashed").await.unwrap();
    (engine, backend, run_id, task)
}

fn two_steps(name: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(name, "1")
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("b").depends_on(["a"]))
}

fn spawn_executor(engine: &Engine) -> Executor {
    let executor = engine.executor(ExecutorConfig {
        worker_id: "survivor".to_string(),
        workers: 2,
        poll_interval: Duration::from_millis(10),
        ..ExecutorConfig::default()
    });
    executor.spawn();
    executor
}

#[tokio::test(start_paused = true)]
async fn crashed_workers_step_is_reclaimed_after_its_lease() {
    let def = two_steps("reclaim");
    let (engine, _backend, run_id, task) = abandoned_step(&def, "a").await;
    assert_eq!(task.attempt, 1);

    engine.bind(
        "reclaim",
        "a",
        handler_fn(|ctx| async move { Ok(json!(ctx.attempt)) }),
    );
    engine.bind("reclaim", "b", returns(json!("b")));
    let executor = spawn_executor(&engine);

    let snapshot = engine.wait_for(run_id, WAIT).await.unwrap();
    executor.shutdown();

    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");
    let a = snapshot.step("a").unwrap();
    assert_eq!(a.attempt, 2);
    assert_eq!(a.result, Some(json!(2)));
    assert_eq!(snapshot.step("b").unwrap().status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn completion_recorded_before_a_crash_still_unblocks_dependents() {
    let def = two_steps("half_done");
    let (engine, backend, run_id, task) = abandoned_step(&def, "a").await;
    assert!(
        backend
            .complete_task(task.id, "crashed", &json!("done"), 5)
            .await
            .unwrap()
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    engine.bind(
        "half_done",
        "a",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(json!("again")) }
        }),
    );
    engine.bind("half_done", "b", returns(json!("b")));
    let executor = spawn_executor(&engine);

    let snapshot = engine.wait_for(run_id, WAIT).await.unwrap();
    executor.shutdown();

    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 0, "a is not re-executed");
    let a = snapshot.step("a").unwrap();
    assert_eq!(a.attempt, 1);
    assert_eq!(a.result, Some(json!("done")));
    assert_eq!(snapshot.step("b").unwrap().status, TaskStatus::Completed);
    let stats = backend.stats(&queue_name("half_done", "a")).await.unwrap();
    assert_eq!(stats.total, 0, "redelivered message is acked");
}

#[tokio::test(start_paused = true)]
async fn lease_covers_the_runs_own_version_timeout() {
    let backend = Arc::new(LocalBackend::new());
    let engine = Engine::new(backend.clone());
    let slow = WorkflowDefinition::new("versioned", "1")
        .step(StepDefinition::new("only").timeout_ms(60_000));
    let fast = WorkflowDefinition::new("versioned", "2")
        .step(StepDefinition::new("only").timeout_ms(1_000));
    engine.register(slow).await.unwrap();
    engine.register(fast).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    engine.bind(
        "versioned",
        "only",
        handler_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                Ok(json!("slow but in time"))
            }
        }),
    );

    let executor = engine.executor(ExecutorConfig {
        worker_id: "lease".to_string(),
        workers: 2,
        lease: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..ExecutorConfig::default()
    });
    executor.spawn();

    let run_id = engine.submit("versioned", "1", json!({})).await.unwrap();
    let snapshot = engine.wait_for(run_id, WAIT).await.unwrap();
    executor.shutdown();

    assert_eq!(snapshot.status, RunStatus::Completed, "{snapshot:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no second worker took the step");
    assert_eq!(snapshot.step("only").unwrap().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_attempt_counts_toward_neither_rate() {
    let def = single("in_flight");
    let (engine, _backend, run_id, _task) = abandoned_step(&def, "only").await;

    let m = engine.metrics(run_id).await.unwrap();
    assert_eq!(m.attempts, 1);
    assert_eq!(m.steps_completed, 0);
    assert_eq!(m.success_rate, 0.0);
    assert_eq!(m.error_rate, 0.0);
}
