//! Error types for dagq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed workflow definition, rejected at registration.
    #[error("invalid workflow definition: {0}")]
    Validation(String),

    /// `(name, version)` already registered with different content.
    #[error("workflow {name} version {version} is already registered with different content")]
    VersionConflict { name: String, version: String },

    /// A step function table does not cover every step of a definition.
    #[error("no handler for steps {steps:?} of workflow {workflow}")]
    MissingHandler { workflow: String, steps: Vec<String> },

    /// Lost a conditional update to another worker. Absorbed by the executor.
    #[error("claim race on {0}")]
    ClaimRace(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
