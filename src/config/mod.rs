//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use crate::engine::ExecutorConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Postgres pool size.
    pub max_connections: u32,
    /// Minimum message lease for workers.
    pub lease_seconds: u64,
    /// Worker poll fallback interval.
    pub poll_interval_ms: u64,
    /// Worker loops per executor.
    pub workers: usize,
    /// Prefix for worker ids; also reported as the telemetry instance id.
    pub worker_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_connections: parsed_var("DAGQ_MAX_CONNECTIONS", 10)?,
            lease_seconds: parsed_var("DAGQ_LEASE_SECONDS", 30)?,
            poll_interval_ms: parsed_var("DAGQ_POLL_INTERVAL_MS", 1_000)?,
            workers: parsed_var("DAGQ_WORKERS", 4)?,
            worker_id: std::env::var("DAGQ_WORKER_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| ExecutorConfig::default().worker_id),
        })
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            worker_id: self.worker_id.clone(),
            workers: self.workers,
            lease: Duration::from_secs(self.lease_seconds),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ExecutorConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
