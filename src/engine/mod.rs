//! The workflow engine: registration, submission, status and metrics.
//!
//! `Engine` is a cheap handle over shared state. It caches validated
//! definitions, maps each step queue back to its workflow and step, and
//! owns the handler bindings that [`Executor`] workers dispatch to.

pub mod dynamic;
pub mod executor;
pub mod handler;

pub use dynamic::DynamicOptions;
pub use executor::{Executor, ExecutorConfig};
pub use handler::{StepContext, StepError, StepHandler, StepResult, StepTable, handler_fn};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dag::{self, StepGraph};
use crate::error::{Error, Result};
use crate::local::LocalBackend;
use crate::model::*;
use crate::queue::{dead_letter_queue, queue_name};
use crate::store::{Backend, NewRun, NewStepTask};
use crate::telemetry::metrics;
use handler::HandlerRegistry;

/// How often [`Engine::wait_for`] re-reads run state.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// A validated definition with its derived graph.
#[derive(Debug)]
pub(crate) struct LoadedDefinition {
    pub(crate) id: Uuid,
    pub(crate) definition: WorkflowDefinition,
    pub(crate) graph: StepGraph,
}

/// Where a step queue's messages go, from the latest registered version.
#[derive(Debug, Clone)]
pub(crate) struct QueueRoute {
    pub(crate) workflow: String,
    pub(crate) step: String,
    pub(crate) concurrency: usize,
    pub(crate) timeout: Duration,
    registered_at: DateTime<Utc>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    handlers: HandlerRegistry,
    definitions: DashMap<(String, String), Arc<LoadedDefinition>>,
    routes: DashMap<String, QueueRoute>,
}

/// Handle to a workflow engine. Clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                handlers: HandlerRegistry::default(),
                definitions: DashMap::new(),
                routes: DashMap::new(),
            }),
        }
    }

    /// Engine over a fresh in-process backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(LocalBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Validate and store a definition, then create its step queues and
    /// their dead-letter twins.
    ///
    /// # Errors
    /// [`Error::Validation`] for a malformed definition,
    /// [`Error::VersionConflict`] if `(name, version)` exists with
    /// different content.
    pub async fn register(&self, def: WorkflowDefinition) -> Result<RegisteredDefinition> {
        let graph = dag::validate(&def)?;
        self.check_queue_ownership(&def)?;

        let registered = self.inner.backend.register_definition(&def).await?;
        self.create_queues(&registered.definition).await?;
        self.install(&registered, graph);

        info!(
            workflow = %def.name,
            version = %def.version,
            steps = def.steps.len(),
            "workflow registered"
        );
        Ok(registered)
    }

    /// Bind a handler to a step of every version of a workflow.
    pub fn bind(&self, workflow: &str, step: &str, handler: Arc<dyn StepHandler>) {
        self.inner.handlers.bind(workflow, step, handler);
    }

    /// Bind a whole step table to a workflow.
    pub fn bind_all(&self, workflow: &str, table: StepTable) {
        for (step, handler) in table {
            self.inner.handlers.bind(workflow, &step, handler);
        }
    }

    /// Load a registered definition into this engine so its queues are
    /// served. Needed only in processes that never call [`Engine::register`].
    pub async fn load(&self, r: &DefinitionRef) -> Result<RegisteredDefinition> {
        let registered = self.inner.backend.get_definition(r).await?;
        let graph = dag::validate(&registered.definition)?;
        self.install(&registered, graph);
        Ok(registered)
    }

    /// Load every registered definition.
    pub async fn refresh(&self) -> Result<usize> {
        let all = self.inner.backend.list_definitions().await?;
        let count = all.len();
        for registered in &all {
            let graph = dag::validate(&registered.definition)?;
            self.install(registered, graph);
        }
        Ok(count)
    }

    /// Start a run of `workflow` at `version` and dispatch its roots.
    pub async fn submit(
        &self,
        workflow: &str,
        version: &str,
        input: serde_json::Value,
    ) -> Result<RunId> {
        let loaded = self.definition(workflow, version).await?;
        self.start_run(&loaded, input).await
    }

    pub async fn status(&self, run: RunId) -> Result<RunSnapshot> {
        let backend = &self.inner.backend;
        let record = backend.get_run(run).await?;
        let tasks = backend.list_tasks(run).await?;
        Ok(RunSnapshot::new(&record, &tasks))
    }

    pub async fn metrics(&self, run: RunId) -> Result<RunMetrics> {
        let backend = &self.inner.backend;
        let record = backend.get_run(run).await?;
        let tasks = backend.list_tasks(run).await?;
        Ok(RunMetrics::from_run(&record, &tasks, backend.now()))
    }

    /// Metrics summed over every run of a workflow.
    pub async fn workflow_metrics(&self, workflow: &str) -> Result<RunMetrics> {
        let backend = &self.inner.backend;
        let now = backend.now();
        let mut per_run = Vec::new();
        for run in backend.list_runs(workflow, i64::MAX).await? {
            let tasks = backend.list_tasks(run.id).await?;
            per_run.push(RunMetrics::from_run(&run, &tasks, now));
        }
        Ok(RunMetrics::aggregate(&per_run))
    }

    /// Poll until the run is terminal or `timeout` passes, returning the
    /// last snapshot either way.
    pub async fn wait_for(&self, run: RunId, timeout: Duration) -> Result<RunSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.status(run).await?;
            if snapshot.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Worker pool serving this engine's queues.
    pub fn executor(&self, config: ExecutorConfig) -> Executor {
        Executor::new(self.clone(), config)
    }

    // -----------------------------------------------------------------------
    // Internals shared with the executor and dynamic loader
    // -----------------------------------------------------------------------

    pub(crate) fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Cached definition, fetched from the store on a miss.
    pub(crate) async fn definition(
        &self,
        workflow: &str,
        version: &str,
    ) -> Result<Arc<LoadedDefinition>> {
        let key = (workflow.to_string(), version.to_string());
        if let Some(hit) = self.inner.definitions.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let registered = self
            .inner
            .backend
            .get_definition(&DefinitionRef::version(workflow, version))
            .await?;
        let graph = dag::validate(&registered.definition)?;
        Ok(self.install(&registered, graph))
    }

    pub(crate) fn route(&self, queue: &str) -> Option<QueueRoute> {
        self.inner.routes.get(queue).map(|r| r.value().clone())
    }

    /// Queues that have a handler bound in this engine.
    pub(crate) fn served_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .inner
            .routes
            .iter()
            .filter(|r| self.inner.handlers.serves(&r.workflow, &r.step))
            .map(|r| r.key().clone())
            .collect();
        queues.sort();
        queues
    }

    pub(crate) async fn create_queues(&self, def: &WorkflowDefinition) -> Result<()> {
        for step in &def.steps {
            let queue = queue_name(&def.name, &step.id);
            self.inner.backend.create_queue(&queue).await?;
            self.inner
                .backend
                .create_queue(&dead_letter_queue(&queue))
                .await?;
        }
        Ok(())
    }

    /// Cache a definition and point its step queues at it if it is the
    /// newest registration seen.
    fn install(&self, registered: &RegisteredDefinition, graph: StepGraph) -> Arc<LoadedDefinition> {
        let def = &registered.definition;
        let loaded = Arc::new(LoadedDefinition {
            id: registered.id,
            definition: def.clone(),
            graph,
        });

        for step in &def.steps {
            let route = QueueRoute {
                workflow: def.name.clone(),
                step: step.id.clone(),
                concurrency: def.step_concurrency(step).max(1) as usize,
                timeout: def.step_timeout(step),
                registered_at: registered.registered_at,
            };
            self.inner
                .routes
                .entry(queue_name(&def.name, &step.id))
                .and_modify(|current| {
                    if route.registered_at >= current.registered_at {
                        *current = route.clone();
                    }
                })
                .or_insert_with(|| route.clone());
        }

        self.inner.definitions.insert(
            (def.name.clone(), def.version.clone()),
            Arc::clone(&loaded),
        );
        debug!(workflow = %def.name, version = %def.version, "definition cached");
        loaded
    }

    /// Two distinct steps must never share a queue after name sanitizing.
    fn check_queue_ownership(&self, def: &WorkflowDefinition) -> Result<()> {
        for step in &def.steps {
            let queue = queue_name(&def.name, &step.id);
            let Some(route) = self.inner.routes.get(&queue) else {
                continue;
            };
            if route.workflow != def.name || route.step != step.id {
                return Err(Error::Validation(format!(
                    "step '{}' of '{}' maps to queue '{queue}', already used by step '{}' of '{}'",
                    step.id, def.name, route.step, route.workflow
                )));
            }
        }
        Ok(())
    }

    pub(crate) async fn start_run(
        &self,
        loaded: &LoadedDefinition,
        input: serde_json::Value,
    ) -> Result<RunId> {
        let def = &loaded.definition;
        let tasks = loaded
            .graph
            .order()
            .iter()
            .map(|step| NewStepTask {
                id: TaskId::new(),
                step_id: step.clone(),
                queue_name: queue_name(&def.name, step),
                status: if loaded.graph.roots().contains(step) {
                    TaskStatus::Queued
                } else {
                    TaskStatus::Blocked
                },
            })
            .collect();

        let run = self
            .inner
            .backend
            .create_run(NewRun {
                id: RunId::new(),
                workflow_id: loaded.id,
                workflow_name: def.name.clone(),
                version: def.version.clone(),
                input,
                tasks,
            })
            .await?;
        // A fast worker may already have finished the run
        self.inner.backend.mark_run_running(run.id).await?;

        metrics::runs_submitted().add(
            1,
            &[
                KeyValue::new("workflow", def.name.clone()),
                KeyValue::new("version", def.version.clone()),
            ],
        );
        info!(run_id = %run.id, workflow = %def.name, version = %def.version, "run submitted");
        Ok(run.id)
    }
}
