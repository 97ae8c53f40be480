//! dagq CLI: operator interface to the workflow engine.
//!
//! Workers are not started here; step handlers are code supplied by the
//! programs that embed the engine.

use clap::{Parser, Subcommand};
use dagq::config::Config;
use dagq::config::secrets::{ExposeSecret, redacted_url};
use dagq::db::Db;
use dagq::definition;
use dagq::engine::Engine;
use dagq::model::{DefinitionRef, RunId};
use dagq::queue::{Queue, dead_letter_queue};
use dagq::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dagq", about = "Durable DAG workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Workflow definition operations
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Queue administration
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Register definitions from a .toml/.json file or a directory of them
    Register {
        path: PathBuf,
    },
    /// List registered definitions
    List,
    /// Show a definition
    Show {
        name: String,
        /// Version (latest registration when omitted)
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Submit a run
    Submit {
        workflow: String,
        version: String,
        /// JSON input payload
        #[arg(long)]
        input: Option<String>,
    },
    /// Show a run and its steps
    Status {
        /// Run ID (full UUID)
        id: String,
    },
    /// Show derived metrics for a run, or for a whole workflow
    Metrics {
        /// Run ID (full UUID)
        id: Option<String>,
        /// Aggregate over every run of this workflow instead
        #[arg(long)]
        workflow: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue (idempotent)
    Create { queue: String },
    /// Send a JSON message
    Send {
        queue: String,
        payload: String,
        /// Delay before the message becomes visible, in seconds
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Show queue depth
    Stats { queue: String },
    /// Delete every message in a queue
    Purge { queue: String },
    /// List a queue's dead-letter entries
    Dlq {
        queue: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config("dagq", &config))?;

    let db = Arc::new(
        Db::connect_with(config.database_url.expose_secret(), config.max_connections).await?,
    );

    match cli.command {
        Command::Migrate => {
            db.migrate().await?;
            tracing::info!(database = %redacted_url(&config.database_url), "migrations applied");
            println!("Migrations applied.");
            Ok(())
        }
        Command::Workflow { action } => {
            let engine = Engine::new(db.clone());
            match action {
                WorkflowAction::Register { path } => cmd_workflow_register(&engine, path).await,
                WorkflowAction::List => cmd_workflow_list(&engine).await,
                WorkflowAction::Show { name, version } => {
                    cmd_workflow_show(&engine, name, version).await
                }
            }
        }
        Command::Run { action } => {
            let engine = Engine::new(db.clone());
            match action {
                RunAction::Submit {
                    workflow,
                    version,
                    input,
                } => cmd_run_submit(&engine, workflow, version, input).await,
                RunAction::Status { id } => cmd_run_status(&engine, id).await,
                RunAction::Metrics { id, workflow } => cmd_run_metrics(&engine, id, workflow).await,
            }
        }
        Command::Queue { action } => match action {
            QueueAction::Create { queue } => {
                db.create_queue(&queue).await?;
                db.create_queue(&dead_letter_queue(&queue)).await?;
                println!("Queue {queue} ready.");
                Ok(())
            }
            QueueAction::Send {
                queue,
                payload,
                delay,
            } => {
                let payload: serde_json::Value = serde_json::from_str(&payload)?;
                let msg_id = db
                    .send(&queue, &payload, Duration::from_secs(delay))
                    .await?;
                println!("Sent message {msg_id} to {queue}.");
                Ok(())
            }
            QueueAction::Stats { queue } => {
                let stats = db.stats(&queue).await?;
                println!("Queue:      {queue}");
                println!("Total:      {}", stats.total);
                println!("In flight:  {}", stats.in_flight);
                println!("Available:  {}", stats.available);
                println!("Delayed:    {}", stats.delayed);
                Ok(())
            }
            QueueAction::Purge { queue } => {
                let removed = db.purge(&queue).await?;
                println!("Purged {removed} message(s) from {queue}.");
                Ok(())
            }
            QueueAction::Dlq { queue, limit } => cmd_queue_dlq(&db, queue, limit).await,
        },
    }
}

async fn cmd_workflow_register(engine: &Engine, path: PathBuf) -> anyhow::Result<()> {
    let definitions = if path.is_dir() {
        definition::load_from_dir(&path)?
    } else {
        vec![definition::load_file(&path)?]
    };

    for def in definitions {
        let registered = engine.register(def).await?;
        println!(
            "Registered: {}@{} ({})",
            registered.definition.name, registered.definition.version, registered.id
        );
    }
    Ok(())
}

async fn cmd_workflow_list(engine: &Engine) -> anyhow::Result<()> {
    let definitions = engine.backend().list_definitions().await?;
    if definitions.is_empty() {
        println!("No workflows registered.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<12}  {:<5}  REGISTERED",
        "NAME", "VERSION", "STEPS"
    );
    println!("{}", "-".repeat(70));
    for registered in &definitions {
        let def = &registered.definition;
        println!(
            "{:<24}  {:<12}  {:<5}  {}",
            def.name,
            def.version,
            def.steps.len(),
            registered.registered_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} workflow(s)", definitions.len());
    Ok(())
}

async fn cmd_workflow_show(
    engine: &Engine,
    name: String,
    version: Option<String>,
) -> anyhow::Result<()> {
    let r = match version {
        Some(version) => DefinitionRef::version(name, version),
        None => DefinitionRef::Name(name),
    };
    let registered = engine.backend().get_definition(&r).await?;
    println!("ID:          {}", registered.id);
    println!("Registered:  {}", registered.registered_at);
    println!(
        "{}",
        serde_json::to_string_pretty(&registered.definition)?
    );
    Ok(())
}

async fn cmd_run_submit(
    engine: &Engine,
    workflow: String,
    version: String,
    input: Option<String>,
) -> anyhow::Result<()> {
    let input: serde_json::Value = match input {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let run_id = engine.submit(&workflow, &version, input).await?;
    println!("Submitted: {run_id}");
    Ok(())
}

fn parse_run_id(id: &str) -> anyhow::Result<RunId> {
    Ok(RunId(uuid::Uuid::parse_str(id)?))
}

async fn cmd_run_status(engine: &Engine, id: String) -> anyhow::Result<()> {
    let snapshot = engine.status(parse_run_id(&id)?).await?;

    println!("Run:        {}", snapshot.run_id);
    println!(
        "Workflow:   {}@{}",
        snapshot.workflow_name, snapshot.version
    );
    println!("Status:     {}", snapshot.status);
    println!("Attempt:    {}", snapshot.attempt);
    println!("Created:    {}", snapshot.created_at);
    if let Some(done) = snapshot.completed_at {
        println!("Completed:  {done}");
    }
    if let Some(ref error) = snapshot.error {
        println!("Error:      {error}");
    }
    println!("---");
    println!("{:<24}  {:<12}  {:<7}  ERROR", "STEP", "STATUS", "ATTEMPT");
    for step in &snapshot.steps {
        let status = if step.degraded {
            format!("{} (degraded)", step.status)
        } else {
            step.status.to_string()
        };
        println!(
            "{:<24}  {:<12}  {:<7}  {}",
            step.id,
            status,
            step.attempt,
            step.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_run_metrics(
    engine: &Engine,
    id: Option<String>,
    workflow: Option<String>,
) -> anyhow::Result<()> {
    let m = match (id, workflow) {
        (_, Some(workflow)) => engine.workflow_metrics(&workflow).await?,
        (Some(id), None) => engine.metrics(parse_run_id(&id)?).await?,
        (None, None) => anyhow::bail!("give a run id or --workflow"),
    };
    println!("Execution time:  {}ms", m.execution_time_ms);
    println!("Success rate:    {:.3}", m.success_rate);
    println!("Error rate:      {:.3}", m.error_rate);
    println!("Throughput:      {:.3} steps/s", m.throughput);
    println!("Steps completed: {}", m.steps_completed);
    println!("Attempts:        {}", m.attempts);
    println!("Failures:        {}", m.failures);
    Ok(())
}

async fn cmd_queue_dlq(db: &Db, queue: String, limit: i64) -> anyhow::Result<()> {
    let dlq = if queue.ends_with(dagq::queue::DEAD_LETTER_SUFFIX) {
        queue
    } else {
        dead_letter_queue(&queue)
    };
    let entries = db.peek_queue(&dlq, limit).await?;
    if entries.is_empty() {
        println!("No dead-letter entries in {dlq}.");
        return Ok(());
    }
    for entry in &entries {
        let reason = entry
            .message
            .get("dlq_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        println!("#{}  {}  {reason}", entry.msg_id, entry.enqueued_at.format("%Y-%m-%d %H:%M:%S"));
        println!("    {}", serde_json::to_string(&entry.message)?);
    }
    println!("\n{} entr(ies)", entries.len());
    Ok(())
}
