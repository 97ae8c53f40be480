//! Core data model.
//!
//! Definitions describe what a workflow is; runs and step tasks record what
//! happened when it executed.

pub mod definition;
pub mod run;

pub use definition::*;
pub use run::*;
