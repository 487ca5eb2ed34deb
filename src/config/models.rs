//! Configuration data structures for turnstile.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! to `TURNSTILE_*` environment variables. Every field has a default so an
//! empty file, or no file at all, yields a working gateway.
use std::time::Duration;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Admission limits applied to `/proxy` routes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of requests holding a slot at once
    pub max_concurrent: usize,
    /// How long a caller may wait in the queue, in humantime syntax ("30s", "500ms")
    pub acquire_timeout: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            acquire_timeout: "30s".to_string(),
        }
    }
}

impl AdmissionConfig {
    pub fn acquire_timeout(&self) -> Result<Duration> {
        parse_duration("admission.acquire_timeout", &self.acquire_timeout)
    }
}

/// Log output settings. `RUST_LOG`, when set, takes precedence over `level`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// JSON lines when true, human-readable output otherwise
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Take the client identity from the first `X-Forwarded-For` entry
    pub trust_forwarded_for: bool,
    /// Upper bound on draining in-flight requests at shutdown
    pub shutdown_timeout: String,
    pub admission: AdmissionConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            trust_forwarded_for: false,
            shutdown_timeout: "30s".to_string(),
            admission: AdmissionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration("shutdown_timeout", &self.shutdown_timeout)
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).wrap_err_with(|| format!("Invalid duration for {field}: '{value}'"))
}

/// Builder for ServerConfig, mostly for tests and embedding
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.admission.max_concurrent = max_concurrent;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.admission.acquire_timeout = humantime::format_duration(timeout).to_string();
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.config.trust_forwarded_for = trust;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
