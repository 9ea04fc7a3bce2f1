//! Agent configuration.
//!
//! Values come from defaults, environment variables (`RELAY_*`) or a JSON
//! config file; the binary layers CLI flags on top.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::RelayError;

/// Default connect/ping timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long `stop()` waits for the listener to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the inbound message queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Parsed agent configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Endpoint address, e.g. `tcp://127.0.0.1:7400` or `test://localhost`.
    pub endpoint: String,

    /// Deadline for connecting and for each ping.
    pub timeout: Duration,

    /// How long `stop()` waits for the listener before aborting it.
    pub shutdown_timeout: Duration,

    /// Capacity of the inbound message queue between transport and listener.
    pub inbound_capacity: usize,
}

impl AgentConfig {
    /// Config for `endpoint` with all other values defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// Create from the file configuration values.
    pub fn from_file_config(file: &AgentConfigFile) -> Self {
        Self {
            endpoint: file.endpoint.clone(),
            timeout: Duration::from_secs(file.timeout_seconds),
            shutdown_timeout: Duration::from_secs(file.shutdown_timeout_seconds),
            inbound_capacity: file.inbound_capacity,
        }
    }

    /// Load from a JSON config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let file: AgentConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(Self::from_file_config(&file))
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `RELAY_ENDPOINT`, `RELAY_TIMEOUT_SECONDS` and
    /// `RELAY_SHUTDOWN_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("RELAY_ENDPOINT").context("RELAY_ENDPOINT not set")?;
        Ok(Self {
            timeout: env_seconds("RELAY_TIMEOUT_SECONDS")?.unwrap_or(DEFAULT_TIMEOUT),
            shutdown_timeout: env_seconds("RELAY_SHUTDOWN_TIMEOUT_SECONDS")?
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            ..Self::new(endpoint)
        })
    }

    /// Check the values and parse the endpoint.
    pub fn validate(&self) -> Result<Endpoint, RelayError> {
        if self.timeout.is_zero() {
            return Err(RelayError::Configuration(
                "timeout must be positive".to_string(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(RelayError::Configuration(
                "inbound capacity must be positive".to_string(),
            ));
        }
        Endpoint::parse(&self.endpoint)
    }
}

fn env_seconds(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(v) => {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds, got '{v}'"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Agent configuration as read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfigFile {
    /// Endpoint address.
    pub endpoint: String,

    /// Connect/ping timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Listener shutdown bound in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Inbound queue capacity.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

const fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_secs()
}

const fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

/// Transport family selected by the endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `tcp://host:port`
    Tcp,
    /// `test://name` or `memory://name`, an in-process loopback.
    Memory,
}

/// A validated endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    /// Everything after `scheme://`.
    pub address: String,
    raw: String,
}

impl Endpoint {
    /// Parse `scheme://address`.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RelayError::Configuration(
                "endpoint address must not be empty".to_string(),
            ));
        }

        let malformed =
            |reason: &str| RelayError::Configuration(format!("malformed endpoint '{raw}': {reason}"));

        let (scheme, address) = raw
            .split_once("://")
            .ok_or_else(|| malformed("expected scheme://address"))?;

        if address.is_empty() {
            return Err(malformed("missing address"));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(malformed("address contains whitespace"));
        }

        let scheme_name = scheme.to_ascii_lowercase();
        let scheme = match scheme_name.as_str() {
            "tcp" => Scheme::Tcp,
            "test" | "memory" => Scheme::Memory,
            other => return Err(malformed(&format!("unsupported scheme '{other}'"))),
        };

        if scheme == Scheme::Tcp {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| malformed("tcp address must be host:port"))?;
            if host.is_empty() {
                return Err(malformed("missing host"));
            }
            port.parse::<u16>()
                .map_err(|_| malformed(&format!("invalid port '{port}'")))?;
        }

        Ok(Self {
            scheme,
            address: address.to_string(),
            raw: format!("{scheme_name}://{address}"),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
