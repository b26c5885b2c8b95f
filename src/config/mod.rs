//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `SecretString` so it never
//! lands in logs.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use secrets::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub db_max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(database_url()?),
            db_max_connections: parsed_var("DB_MAX_CONNECTIONS", 5)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_count: parsed_var("WORKER_COUNT", 1)?,
            poll_interval: Duration::from_millis(parsed_var("POLL_INTERVAL_MS", 1000)?),
            error_backoff: Duration::from_millis(parsed_var("ERROR_BACKOFF_MS", 5000)?),
        })
    }
}

/// `DATABASE_URL`, or a URL assembled from the `DB_*` parts when `DB_NAME`
/// is set.
fn database_url() -> Result<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Ok(url);
    }
    let Ok(name) = std::env::var("DB_NAME") else {
        return Err(Error::Config(
            "required environment variable DATABASE_URL is not set (nor DB_NAME)".to_string(),
        ));
    };
    let var_or = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(format!(
        "postgres://{}:{}@{}:{}/{}",
        var_or("DB_USER", "postgres"),
        var_or("DB_PASSWORD", "password"),
        var_or("DB_HOST", "localhost"),
        var_or("DB_PORT", "5432"),
        name
    ))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
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
