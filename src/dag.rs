//! Definition validation and the derived step graph.
//!
//! Rules enforced at registration:
//! 1. Workflow name, version and step ids are non-empty identifiers.
//! 2. Step ids are unique within the workflow.
//! 3. Every `depends_on` and `next` id names an existing step, and `next`
//!    agrees with the dependents' `depends_on`.
//! 4. The graph is acyclic (topological sort must succeed), has at least
//!    one root, and every step is reachable from a root.
//! 5. Concurrency is at least 1, timeouts are non-zero, and error handler
//!    attempt limits are at least 1.
//! 6. Every derived queue name is valid for the queue backend.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::model::WorkflowDefinition;
use crate::queue;

/// Adjacency derived from a validated definition.
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Step ids in a topological order.
    order: Vec<String>,
    roots: Vec<String>,
    dependents: BTreeMap<String, Vec<String>>,
    dependencies: BTreeMap<String, Vec<String>>,
}

impl StepGraph {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Steps that list `step` in their `depends_on`.
    pub fn dependents(&self, step: &str) -> &[String] {
        self.dependents.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependencies(&self, step: &str) -> &[String] {
        self.dependencies.get(step).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Validation(msg.into())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Validate a definition and return its step graph.
///
/// # Errors
/// [`Error::Validation`] describing the first violated rule.
pub fn validate(def: &WorkflowDefinition) -> Result<StepGraph> {
    if !is_identifier(&def.name) {
        return Err(invalid(format!("invalid workflow name '{}'", def.name)));
    }
    if !is_identifier(&def.version) {
        return Err(invalid(format!("invalid version '{}'", def.version)));
    }
    if def.steps.is_empty() {
        return Err(invalid("workflow has no steps"));
    }
    if def.config.concurrency < 1 {
        return Err(invalid("workflow concurrency must be at least 1"));
    }
    if def.config.timeout_ms == 0 {
        return Err(invalid("workflow timeout_ms must be positive"));
    }
    for handler in &def.error_handlers {
        if handler.max_attempts == Some(0) {
            return Err(invalid("error handler max_attempts must be at least 1"));
        }
    }

    // Unique, well-formed step ids
    let mut ids: HashSet<&str> = HashSet::new();
    for step in &def.steps {
        if !is_identifier(&step.id) {
            return Err(invalid(format!("invalid step id '{}'", step.id)));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id '{}'", step.id)));
        }
        if step.config.concurrency == Some(0) {
            return Err(invalid(format!(
                "step '{}' concurrency must be at least 1",
                step.id
            )));
        }
        if step.config.timeout_ms == Some(0) {
            return Err(invalid(format!("step '{}' timeout_ms must be positive", step.id)));
        }
        queue::validate_queue_name(&queue::queue_name(&def.name, &step.id))
            .map_err(|e| invalid(format!("step '{}': {e}", step.id)))?;
    }

    // Edges
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for step in &def.steps {
        dependents.entry(step.id.clone()).or_default();
        in_degree.entry(step.id.as_str()).or_insert(0);
        let mut seen = HashSet::new();
        for dep in step.deps() {
            if !ids.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                )));
            }
            if dep == &step.id {
                return Err(invalid(format!("step '{}' depends on itself", step.id)));
            }
            if !seen.insert(dep.as_str()) {
                continue;
            }
            dependents
                .entry(dep.clone())
                .or_default()
                .push(step.id.clone());
            dependencies
                .entry(step.id.clone())
                .or_default()
                .push(dep.clone());
            *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
        }
    }

    // Forward pointers must mirror depends_on
    for step in &def.steps {
        let Some(next) = &step.next else { continue };
        for n in next {
            if !ids.contains(n.as_str()) {
                return Err(invalid(format!(
                    "step '{}' points next to unknown step '{n}'",
                    step.id
                )));
            }
            if !dependents[&step.id].contains(n) {
                return Err(invalid(format!(
                    "step '{}' lists '{n}' in next, but '{n}' does not depend on it",
                    step.id
                )));
            }
        }
        if next.len() != dependents[&step.id].len() {
            return Err(invalid(format!(
                "step '{}' next pointers do not match its dependents",
                step.id
            )));
        }
    }

    let roots: Vec<String> = def
        .steps
        .iter()
        .filter(|s| s.is_root())
        .map(|s| s.id.clone())
        .collect();
    if roots.is_empty() {
        return Err(invalid("workflow has no root step"));
    }

    // Kahn's algorithm, seeded in declaration order for a stable result
    let mut queue: VecDeque<&str> = roots.iter().map(String::as_str).collect();
    let mut order: Vec<String> = Vec::with_capacity(def.steps.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_owned());
        for dependent in &dependents[id] {
            if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }
    }

    // Unvisited steps sit on (or behind) a cycle and are unreachable from a root
    if order.len() != def.steps.len() {
        let visited: HashSet<&str> = order.iter().map(String::as_str).collect();
        let stuck: Vec<&str> = def
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !visited.contains(id))
            .collect();
        return Err(invalid(format!(
            "step graph contains a cycle or unreachable steps: {stuck:?}"
        )));
    }

    Ok(StepGraph {
        order,
        roots,
        dependents,
        dependencies,
    })
}
