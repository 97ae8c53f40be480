//! Dynamic execution: run a stored definition with a step table supplied
//! at call time.

use std::time::Duration;
use tracing::info;

use super::handler::StepTable;
use super::Engine;
use crate::dag;
use crate::error::{Error, Result};
use crate::model::{DefinitionRef, RunSnapshot};

/// Options for [`Engine::execute_dynamic`].
#[derive(Debug, Clone, Default)]
pub struct DynamicOptions {
    /// Wait up to this long for the run to finish before returning.
    /// `None` returns right after submission.
    pub wait: Option<Duration>,
}

impl DynamicOptions {
    pub fn wait(timeout: Duration) -> Self {
        Self {
            wait: Some(timeout),
        }
    }
}

impl Engine {
    /// Load a registered definition by id or name, check that `table` has a
    /// handler for every step, bind it to that exact version and start a
    /// run. An executor of this engine must be running for the run to make
    /// progress.
    ///
    /// # Errors
    /// [`Error::MissingHandler`] naming every uncovered step; nothing is
    /// submitted in that case.
    pub async fn execute_dynamic(
        &self,
        r: &DefinitionRef,
        input: serde_json::Value,
        table: StepTable,
        opts: DynamicOptions,
    ) -> Result<RunSnapshot> {
        let registered = self.backend().get_definition(r).await?;
        let def = &registered.definition;

        let missing: Vec<String> = def
            .steps
            .iter()
            .filter(|s| !table.contains_key(&s.id))
            .map(|s| s.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingHandler {
                workflow: def.name.clone(),
                steps: missing,
            });
        }

        dag::validate(def)?;
        self.create_queues(def).await?;
        self.handlers().bind_version(&def.name, &def.version, &table);
        let loaded = self.definition(&def.name, &def.version).await?;

        let run_id = self.start_run(&loaded, input).await?;
        info!(run_id = %run_id, workflow = %def.name, version = %def.version, "dynamic run started");

        match opts.wait {
            Some(timeout) => self.wait_for(run_id, timeout).await,
            None => self.status(run_id).await,
        }
    }
}
