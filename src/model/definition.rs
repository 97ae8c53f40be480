//! Workflow and step definitions.
//!
//! A definition is pure data: a DAG of steps plus per-workflow and per-step
//! configuration. Definitions are immutable once registered and identified
//! by `(name, version)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Static description of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human key. Unique together with `version`.
    pub name: String,

    pub version: String,

    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub config: WorkflowConfig,

    /// Escalation policy once a step exhausts its attempts.
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,

    /// Derived metrics to record for this workflow. Empty records all.
    #[serde(default)]
    pub metrics: BTreeSet<MetricName>,
}

/// Workflow-wide defaults. Steps may override `timeout_ms` and `concurrency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt. `max_attempts = retries + 1`.
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub concurrency: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 3,
            retry_delay_ms: 1_000,
            concurrency: 1,
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            steps: Vec::new(),
            config: WorkflowConfig::default(),
            error_handlers: Vec::new(),
            metrics: BTreeSet::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: u32) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn metric(mut self, metric: MetricName) -> Self {
        self.metrics.insert(metric);
        self
    }

    /// Look up a step by id.
    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Effective deadline for a step.
    pub fn step_timeout(&self, step: &StepDefinition) -> Duration {
        Duration::from_millis(step.config.timeout_ms.unwrap_or(self.config.timeout_ms))
    }

    /// Effective concurrency cap for a step's queue.
    pub fn step_concurrency(&self, step: &StepDefinition) -> u32 {
        step.config.concurrency.unwrap_or(self.config.concurrency)
    }

    /// Whether a derived metric should be recorded.
    pub fn records(&self, metric: MetricName) -> bool {
        self.metrics.is_empty() || self.metrics.contains(&metric)
    }

    /// First error handler matching a failure kind, in declaration order.
    pub fn error_handler_for(&self, kind: FailureKind) -> Option<&ErrorHandler> {
        self.error_handlers.iter().find(|h| h.on_error.matches(kind))
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,

    /// Steps that must complete first. `None` (or empty) marks a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,

    /// Forward pointers. Must agree with the dependents' `depends_on`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Vec<String>>,

    #[serde(default)]
    pub config: StepConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque to the engine; carried for schedulers and handlers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_requirements: BTreeMap<String, serde_json::Value>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: None,
            next: None,
            config: StepConfig::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next = Some(next.into_iter().map(Into::into).collect());
        self
    }

    pub fn concurrency(mut self, n: u32) -> Self {
        self.config.concurrency = Some(n);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = Some(ms);
        self
    }

    pub fn resource(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.resource_requirements.insert(key.into(), value);
        self
    }

    /// Dependency ids; empty for roots.
    pub fn deps(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or(&[])
    }

    pub fn is_root(&self) -> bool {
        self.deps().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Error handling policy
// ---------------------------------------------------------------------------

/// What to do once a step has exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default)]
    pub on_error: ErrorMatch,
    pub action: ErrorAction,
    /// For step retries: overrides `retries + 1`. For `retry_run`: how many
    /// times the whole run may be attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl ErrorHandler {
    pub fn new(on_error: ErrorMatch, action: ErrorAction) -> Self {
        Self {
            on_error,
            action,
            max_attempts: None,
            backoff: None,
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Which failures an error handler applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMatch {
    #[default]
    Any,
    HandlerError,
    Timeout,
    Fatal,
}

impl ErrorMatch {
    pub fn matches(self, kind: FailureKind) -> bool {
        match self {
            ErrorMatch::Any => true,
            ErrorMatch::HandlerError => kind == FailureKind::Handler,
            ErrorMatch::Timeout => kind == FailureKind::Timeout,
            ErrorMatch::Fatal => kind == FailureKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Mark the run failed. The default when no handler matches.
    FailRun,
    /// Reset every step task and start the run over.
    RetryRun,
    /// Keep going: dependents treat the dead-lettered step as satisfied.
    Continue,
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Handler returned a retryable error (or panicked).
    Handler,
    /// Handler exceeded its deadline.
    Timeout,
    /// Handler declared the failure unrecoverable.
    Fatal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Handler => "handler_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base × 2^(attempt-1)`
    #[default]
    Exponential,
    /// `base × attempt`
    Linear,
    /// `base`
    Fixed,
}

impl Backoff {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Fixed => base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    ExecutionTime,
    SuccessRate,
    ErrorRate,
    Throughput,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// A definition as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredDefinition {
    pub id: Uuid,
    pub definition: WorkflowDefinition,
    pub registered_at: DateTime<Utc>,
}

/// How a caller refers to a registered definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionRef {
    Id(Uuid),
    /// Most recently registered version of a workflow.
    Name(String),
    Version { name: String, version: String },
}

impl DefinitionRef {
    pub fn version(name: impl Into<String>, version: impl Into<String>) -> Self {
        DefinitionRef::Version {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionRef::Id(id) => write!(f, "{id}"),
            DefinitionRef::Name(name) => write!(f, "{name}@latest"),
            DefinitionRef::Version { name, version } => write!(f, "{name}@{version}"),
        }
    }
}
