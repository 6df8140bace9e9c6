//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast if required vars are missing.
//! The database URL is wrapped in `SecretString` so it never reaches a log.

pub mod secrets;

use std::time::Duration;

use crate::engine::ControlConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// `TASKRUN_WORKERS`: reconcile workers, overrides the controller config.
    pub workers: Option<usize>,
    /// `TASKRUN_RESYNC_SECS`: periodic resync, overrides the controller config.
    pub resync_period: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers: parsed_var::<usize>("TASKRUN_WORKERS")?,
            resync_period: parsed_var::<u64>("TASKRUN_RESYNC_SECS")?.map(Duration::from_secs),
        })
    }

    /// Apply the environment overrides to a controller config.
    pub fn apply_to(&self, control: &mut ControlConfig) {
        if let Some(workers) = self.workers {
            control.workers = workers;
        }
        if let Some(period) = self.resync_period {
            control.resync_period = period;
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
