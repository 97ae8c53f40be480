//! Step handler contract and the binding registry.
//!
//! Handlers are plain async functions over a [`StepContext`]. The executor
//! owns deadlines, retries and backoff; a handler only reports whether a
//! failure is worth retrying.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::model::RunId;

/// Everything a handler sees about the step it is executing.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub workflow: String,
    pub version: String,
    pub step_id: String,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// The run's input payload.
    pub input: serde_json::Value,
    /// Results of the run's completed steps, by step id.
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Cancelled when the deadline passes or the executor shuts down.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn output(&self, step: &str) -> Option<&serde_json::Value> {
        self.outputs.get(step)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Retried until the step's attempts run out.
    #[error("{0}")]
    Retryable(String),
    /// Dead-lettered immediately, no retries.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn retryable(msg: impl std::fmt::Display) -> Self {
        StepError::Retryable(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        StepError::Fatal(msg.to_string())
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError::Retryable(format!("{e:#}"))
    }
}

pub type StepResult = std::result::Result<serde_json::Value, StepError>;

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> StepResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send,
{
    async fn execute(&self, ctx: StepContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers for a workflow's steps, keyed by step id.
pub type StepTable = HashMap<String, Arc<dyn StepHandler>>;

/// Static bindings per `(workflow, step)` plus version-scoped tables
/// installed by dynamic execution. Version-scoped entries win.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    bound: DashMap<(String, String), Arc<dyn StepHandler>>,
    versioned: DashMap<(String, String, String), Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn bind(&self, workflow: &str, step: &str, handler: Arc<dyn StepHandler>) {
        self.bound
            .insert((workflow.to_string(), step.to_string()), handler);
    }

    pub(crate) fn bind_version(&self, workflow: &str, version: &str, table: &StepTable) {
        for (step, handler) in table {
            self.versioned.insert(
                (workflow.to_string(), version.to_string(), step.clone()),
                Arc::clone(handler),
            );
        }
    }

    pub(crate) fn resolve(
        &self,
        workflow: &str,
        version: &str,
        step: &str,
    ) -> Option<Arc<dyn StepHandler>> {
        let versioned_key = (workflow.to_string(), version.to_string(), step.to_string());
        if let Some(h) = self.versioned.get(&versioned_key) {
            return Some(Arc::clone(h.value()));
        }
        self.bound
            .get(&(workflow.to_string(), step.to_string()))
            .map(|h| Arc::clone(h.value()))
    }

    /// Some handler exists for the step in at least one version.
    pub(crate) fn serves(&self, workflow: &str, step: &str) -> bool {
        self.bound
            .contains_key(&(workflow.to_string(), step.to_string()))
            || self
                .versioned
                .iter()
                .any(|e| e.key().0 == workflow && e.key().2 == step)
    }
}
