//! Definition validation, registration and file loading.

use dagq::engine::Engine;
use dagq::error::Error;
use dagq::model::*;
use dagq::{dag, definition};
use std::time::Duration;

fn diamond() -> WorkflowDefinition {
    WorkflowDefinition::new("diamond", "1.0.0")
        .step(StepDefinition::new("a").next(["b", "c"]))
        .step(StepDefinition::new("b").depends_on(["a"]).next(["d"]))
        .step(StepDefinition::new("c").depends_on(["a"]).next(["d"]))
        .step(StepDefinition::new("d").depends_on(["b", "c"]))
}

fn assert_invalid(def: &WorkflowDefinition, needle: &str) {
    match dag::validate(def) {
        Err(Error::Validation(msg)) => assert!(msg.contains(needle), "got: {msg}"),
        other => panic!("expected validation error containing {needle:?}, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn diamond_graph_orders_roots_first() {
    let graph = dag::validate(&diamond()).unwrap();
    assert_eq!(graph.roots(), ["a"]);
    assert_eq!(graph.order().first().map(String::as_str), Some("a"));
    assert_eq!(graph.order().last().map(String::as_str), Some("d"));
    assert_eq!(graph.dependents("a"), ["b", "c"]);
    assert_eq!(graph.dependencies("d"), ["b", "c"]);
    assert!(graph.dependents("d").is_empty());
}

#[test]
fn rejects_cycles() {
    let def = WorkflowDefinition::new("loop", "1")
        .step(StepDefinition::new("start"))
        .step(StepDefinition::new("x").depends_on(["start", "y"]))
        .step(StepDefinition::new("y").depends_on(["x"]));
    assert_invalid(&def, "cycle");
}

#[test]
fn rejects_graph_without_roots() {
    let def = WorkflowDefinition::new("rootless", "1")
        .step(StepDefinition::new("x").depends_on(["y"]))
        .step(StepDefinition::new("y").depends_on(["x"]));
    assert_invalid(&def, "no root");
}

#[test]
fn rejects_unknown_dependency() {
    let def = WorkflowDefinition::new("dangling", "1")
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("b").depends_on(["ghost"]));
    assert_invalid(&def, "unknown step 'ghost'");
}

#[test]
fn rejects_duplicate_step_ids() {
    let def = WorkflowDefinition::new("dupes", "1")
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("a"));
    assert_invalid(&def, "duplicate step id");
}

#[test]
fn rejects_next_that_disagrees_with_depends_on() {
    let def = WorkflowDefinition::new("pointers", "1")
        .step(StepDefinition::new("a").next(["b"]))
        .step(StepDefinition::new("b"));
    assert_invalid(&def, "does not depend on it");
}

#[test]
fn rejects_empty_and_zero_values() {
    assert_invalid(&WorkflowDefinition::new("empty", "1"), "no steps");
    assert_invalid(
        &WorkflowDefinition::new("", "1").step(StepDefinition::new("a")),
        "workflow name",
    );
    assert_invalid(
        &WorkflowDefinition::new("zero", "1").step(StepDefinition::new("a").concurrency(0)),
        "concurrency",
    );
    assert_invalid(
        &WorkflowDefinition::new("zero", "1").step(StepDefinition::new("a").timeout_ms(0)),
        "timeout_ms",
    );
    assert_invalid(
        &WorkflowDefinition::new("zero", "1")
            .step(StepDefinition::new("a"))
            .on_error(ErrorHandler::new(ErrorMatch::Any, ErrorAction::RetryRun).max_attempts(0)),
        "max_attempts",
    );
}

#[test]
fn rejects_names_too_long_for_a_queue() {
    let def = WorkflowDefinition::new("a_rather_long_workflow_name", "1")
        .step(StepDefinition::new("with_a_long_step_name_too"));
    assert_invalid(&def, "too long");
}

// ---------------------------------------------------------------------------
// Policy helpers
// ---------------------------------------------------------------------------

#[test]
fn backoff_delays() {
    let base = Duration::from_millis(1000);
    assert_eq!(Backoff::Exponential.delay(base, 1), Duration::from_millis(1000));
    assert_eq!(Backoff::Exponential.delay(base, 2), Duration::from_millis(2000));
    assert_eq!(Backoff::Exponential.delay(base, 3), Duration::from_millis(4000));
    assert_eq!(Backoff::Linear.delay(base, 3), Duration::from_millis(3000));
    assert_eq!(Backoff::Fixed.delay(base, 5), base);
    // Huge attempt numbers saturate instead of overflowing
    assert!(Backoff::Exponential.delay(base, 200) >= Duration::from_secs(1_000_000));
}

#[test]
fn first_matching_error_handler_wins() {
    let def = diamond()
        .on_error(ErrorHandler::new(ErrorMatch::Timeout, ErrorAction::Continue))
        .on_error(ErrorHandler::new(ErrorMatch::Any, ErrorAction::FailRun));
    assert_eq!(
        def.error_handler_for(FailureKind::Timeout).map(|h| h.action),
        Some(ErrorAction::Continue)
    );
    assert_eq!(
        def.error_handler_for(FailureKind::Handler).map(|h| h.action),
        Some(ErrorAction::FailRun)
    );
}

#[test]
fn step_overrides_fall_back_to_workflow_config() {
    let def = WorkflowDefinition::new("cfg", "1")
        .timeout_ms(5_000)
        .concurrency(3)
        .step(StepDefinition::new("a"))
        .step(StepDefinition::new("b").depends_on(["a"]).timeout_ms(100).concurrency(1));
    let a = def.get_step("a").unwrap();
    let b = def.get_step("b").unwrap();
    assert_eq!(def.step_timeout(a), Duration::from_millis(5_000));
    assert_eq!(def.step_concurrency(a), 3);
    assert_eq!(def.step_timeout(b), Duration::from_millis(100));
    assert_eq!(def.step_concurrency(b), 1);
}

#[test]
fn empty_metric_set_records_everything() {
    let all = diamond();
    assert!(all.records(MetricName::Throughput));

    let some = diamond().metric(MetricName::SuccessRate);
    assert!(some.records(MetricName::SuccessRate));
    assert!(!some.records(MetricName::Throughput));
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_is_idempotent_for_identical_content() {
    let engine = Engine::in_memory();
    let first = engine.register(diamond()).await.unwrap();
    let second = engine.register(diamond()).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(engine.backend().list_definitions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn register_rejects_changed_content_under_same_version() {
    let engine = Engine::in_memory();
    engine.register(diamond()).await.unwrap();

    let changed = diamond().retries(7);
    match engine.register(changed).await {
        Err(Error::VersionConflict { name, version }) => {
            assert_eq!(name, "diamond");
            assert_eq!(version, "1.0.0");
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn register_creates_step_and_dead_letter_queues() {
    let engine = Engine::in_memory();
    engine.register(diamond()).await.unwrap();

    for step in ["a", "b", "c", "d"] {
        let queue = dagq::queue::queue_name("diamond", step);
        let stats = engine.backend().stats(&queue).await.unwrap();
        assert_eq!(stats.total, 0);
        let dlq = dagq::queue::dead_letter_queue(&queue);
        assert!(engine.backend().stats(&dlq).await.is_ok());
    }
}

#[tokio::test]
async fn lookup_by_name_returns_latest_version() {
    let engine = Engine::in_memory();
    engine.register(diamond()).await.unwrap();
    let mut v2 = diamond();
    v2.version = "2.0.0".to_string();
    let registered = engine.register(v2).await.unwrap();

    let latest = engine
        .backend()
        .get_definition(&DefinitionRef::Name("diamond".to_string()))
        .await
        .unwrap();
    assert_eq!(latest.definition.version, "2.0.0");

    let by_id = engine
        .backend()
        .get_definition(&DefinitionRef::Id(registered.id))
        .await
        .unwrap();
    assert_eq!(by_id.definition, registered.definition);

    let missing = engine
        .backend()
        .get_definition(&DefinitionRef::version("diamond", "9.9.9"))
        .await;
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

const ETL_TOML: &str = r#"
name = "sample_etl"
version = "1.0.0"
metrics = ["execution_time", "success_rate"]

[config]
timeout_ms = 5000
retries = 2
retry_delay_ms = 500
concurrency = 2

[[steps]]
id = "extract"
next = ["transform"]

[[steps]]
id = "transform"
depends_on = ["extract"]
next = ["load"]

[steps.config]
timeout_ms = 1000

[[steps]]
id = "load"
depends_on = ["transform"]

[[error_handlers]]
on_error = "timeout"
action = "retry_run"
max_attempts = 2
"#;

#[test]
fn loads_toml_definition() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.toml");
    std::fs::write(&path, ETL_TOML).unwrap();

    let def = definition::load_file(&path).unwrap();
    assert_eq!(def.name, "sample_etl");
    assert_eq!(def.steps.len(), 3);
    assert_eq!(def.config.retries, 2);
    assert_eq!(def.get_step("transform").unwrap().config.timeout_ms, Some(1000));
    assert_eq!(def.error_handlers[0].on_error, ErrorMatch::Timeout);
    assert_eq!(def.error_handlers[0].action, ErrorAction::RetryRun);
    assert!(def.records(MetricName::SuccessRate));
    assert!(!def.records(MetricName::Throughput));
}

#[test]
fn loads_directory_of_json_and_toml() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a_etl.toml"), ETL_TOML).unwrap();
    std::fs::write(
        dir.path().join("b_diamond.json"),
        serde_json::to_string_pretty(&diamond()).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.path().join("README.md"), "not a definition").unwrap();

    let defs = definition::load_from_dir(dir.path()).unwrap();
    let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["sample_etl", "diamond"]);
    assert_eq!(defs[1], diamond());
}

#[test]
fn invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let cyclic = dir.path().join("cyclic.json");
    std::fs::write(
        &cyclic,
        r#"{"name":"c","version":"1","steps":[
            {"id":"a"},
            {"id":"b","depends_on":["a","c"]},
            {"id":"c","depends_on":["b"]}]}"#,
    )
    .unwrap();
    assert!(matches!(definition::load_file(&cyclic), Err(Error::Validation(_))));

    let yaml = dir.path().join("flow.yaml");
    std::fs::write(&yaml, "name: x").unwrap();
    assert!(matches!(definition::load_file(&yaml), Err(Error::Config(_))));
}
