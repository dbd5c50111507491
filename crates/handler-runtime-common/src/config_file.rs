//! Configuration file structures for handler-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`HandlerEntry`]: Handler source to precompile at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// instance_memory_mb = 64
///
/// [runtime.execution]
/// timeout_ms = 5000
/// max_host_calls = 10000
///
/// [runtime.pool]
/// max_instances = 16
///
/// [runtime.cache]
/// disk_dir = "./cache"
///
/// [[handlers]]
/// id = "on-click"
/// path = "./handlers/on_click.js"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Handlers to precompile into the bytecode cache at startup.
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// A handler entry to precompile at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerEntry {
    /// Identifier for the handler.
    pub id: String,

    /// Path to the handler source file.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.runtime.pool.max_instances, 32);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [runtime.execution]
            timeout_ms = 250
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.execution.timeout_ms, 250);
        // Defaults applied
        assert_eq!(config.runtime.execution.max_host_calls, 10_000);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            instance_memory_mb = 32
            debug = true

            [runtime.execution]
            timeout_ms = 1000
            max_host_calls = 500

            [runtime.pool]
            min_instances = 2
            max_instances = 8

            [runtime.cache]
            disk_dir = "./bytecode"
            disk_max_bytes = 1048576

            [[handlers]]
            id = "on-click"
            path = "./on_click.js"

            [[handlers]]
            id = "on-load"
            path = "./on_load.js"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.engine.instance_memory_mb, 32);
        assert!(config.runtime.engine.debug);
        assert_eq!(config.runtime.execution.max_host_calls, 500);
        assert_eq!(config.runtime.pool.max_instances, 8);
        assert_eq!(config.runtime.cache.disk_dir.as_deref(), Some("./bytecode"));
        assert_eq!(config.runtime.cache.disk_max_bytes, 1_048_576);
        assert_eq!(config.handlers.len(), 2);
        assert_eq!(config.handlers[0].id, "on-click");
        assert_eq!(config.handlers[1].path, "./on_load.js");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
