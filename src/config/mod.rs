//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: struct definitions (`Config`, `ServerConfig`, `ListenConfig`, ...)
//! - [`defaults`]: `default_*` functions used by `#[serde(default = "...")]`
//! - [`validation`]: startup validation, separate from parsing

mod defaults;
mod types;
mod validation;

pub use types::{
    Config, ListenConfig, LogFormat, PersistenceConfig, ReconnectConfig, RoomConfig, ServerConfig,
};
pub use validation::{validate, ValidationError};

use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
