//! Configuration for the relay
//!
//! Every value has a built-in default. There is no config file; a JSON
//! object in `OPENCODE_PTY_CONFIG` may override any subset of fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::WindowSize;

/// Environment variable holding JSON overrides
pub const CONFIG_ENV: &str = "OPENCODE_PTY_CONFIG";

/// Upper bound on the poll interval that still keeps typing responsive
pub const MAX_POLL_INTERVAL_MS: u64 = 200;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program and arguments to run on the PTY
    pub command: Vec<String>,
    /// Initial terminal geometry
    pub window: WindowConfig,
    /// Polling and shutdown policy
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: default_command(),
            window: WindowConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// The wrapped tool
fn default_command() -> Vec<String> {
    vec!["opencode".to_string()]
}

/// Window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Initial height in rows
    pub rows: u16,
    /// Initial width in columns
    pub columns: u16,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            rows: 30,
            columns: 120,
        }
    }
}

impl WindowConfig {
    pub fn size(&self) -> WindowSize {
        WindowSize::new(self.rows, self.columns)
    }
}

/// Polling and shutdown policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Longest single wait for either descriptor to become ready
    pub poll_interval_ms: u64,
    /// Largest read from the PTY master
    pub master_chunk_size: usize,
    /// Largest read from stdin
    pub input_chunk_size: usize,
    /// How long the child gets to exit after SIGTERM before SIGKILL
    pub terminate_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            master_chunk_size: 4096,
            input_chunk_size: 1024,
            terminate_grace_ms: 1000,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Config {
    /// Parse overrides from a JSON object and validate the result
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, with overrides from [`CONFIG_ENV`] when it is set
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(ConfigError::Invalid(format!("{} is not valid UTF-8", CONFIG_ENV)))
            },
        }
    }

    /// Check the values the relay depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() || self.command[0].is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".into()));
        }
        if self.relay.master_chunk_size == 0 || self.relay.input_chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk sizes must be non-zero".into()));
        }
        if self.relay.poll_interval_ms == 0 || self.relay.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be between 1 and {}",
                MAX_POLL_INTERVAL_MS
            )));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
