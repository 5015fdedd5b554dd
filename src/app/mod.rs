//! Application glue module
//!
//! Configuration, logging, and application-level utilities.

mod config;
pub mod logging;

pub use config::{Config, ConfigError, RelayConfig, WindowConfig, CONFIG_ENV, MAX_POLL_INTERVAL_MS};
