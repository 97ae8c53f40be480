//! Workflow definition files.
//!
//! A definition file holds one [`WorkflowDefinition`] at top level, as TOML
//! (`.toml`) or JSON (`.json`). Loaded definitions are validated before they
//! are returned.

use crate::dag;
use crate::error::{Error, Result};
use crate::model::WorkflowDefinition;
use std::path::Path;

/// Load and validate one definition file.
pub fn load_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    let def: WorkflowDefinition = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| {
            Error::Validation(format!("bad definition file {}: {e}", path.display()))
        })?,
        Some("json") => serde_json::from_str(&content).map_err(|e| {
            Error::Validation(format!("bad definition file {}: {e}", path.display()))
        })?,
        _ => {
            return Err(Error::Config(format!(
                "unsupported definition file {} (expected .toml or .json)",
                path.display()
            )));
        }
    };
    dag::validate(&def)?;
    Ok(def)
}

/// Load every `.toml` and `.json` file in a directory, in file-name order.
pub fn load_from_dir(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("cannot read definition dir {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path
            .extension()
            .is_some_and(|ext| ext == "toml" || ext == "json")
        {
            paths.push(path);
        }
    }
    paths.sort();

    paths.iter().map(|p| load_file(p)).collect()
}
