//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if the broker address is missing or
//! malformed. The broker URL carries credentials, so it stays wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub amqp_url: SecretString,
    /// Emit full error traces for failed messages instead of one line.
    pub traceback: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let amqp_url = required_var("AMQP_URL")?;
        validate_broker_url(&amqp_url)?;
        Ok(Self {
            amqp_url: SecretString::from(amqp_url),
            traceback: std::env::var("SERVICE_TRACEBACK").is_ok_and(|v| v == "active"),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Reject empty or non-AMQP broker addresses before anything connects.
pub fn validate_broker_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::Config("broker address is empty".to_string()));
    }
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(Error::Config(
            "broker address must be an amqp:// or amqps:// URL".to_string(),
        ));
    };
    if scheme != "amqp" && scheme != "amqps" {
        return Err(Error::Config(format!(
            "unsupported broker scheme {scheme:?}, expected amqp or amqps"
        )));
    }
    if rest.is_empty() {
        return Err(Error::Config("broker address has no host".to_string()));
    }
    Ok(())
}

/// Check an already-wrapped secret URL.
pub fn validate_secret_url(url: &SecretString) -> Result<()> {
    validate_broker_url(url.expose_secret())
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Tunables for dispatch loops and RPC clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Per-channel prefetch. Handlers run one at a time per queue regardless.
    pub prefetch_count: u16,
    /// Upper bound on a single handler invocation. None = unbounded.
    pub handler_timeout_secs: Option<u64>,
    /// How long `RpcClient::call` waits for a correlated reply.
    pub rpc_timeout_secs: u64,
    /// Declare worker queues as durable.
    pub durable_queues: bool,
    /// Mirrors `Config::traceback`.
    pub traceback: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            handler_timeout_secs: None,
            rpc_timeout_secs: 30,
            durable_queues: false,
            traceback: false,
        }
    }
}

impl WorkerSettings {
    /// Parse settings from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad worker settings: {e}")))
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}
