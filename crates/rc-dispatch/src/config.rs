//! Dispatcher configuration.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Tunables for the dispatcher and its service front.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Background evaluations allowed to run at the same time. Further jobs
    /// wait for a slot.
    pub max_concurrent_evaluations: usize,
    /// Capacity of the service command channel.
    pub command_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: 8,
            command_buffer: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_evaluations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_evaluations",
                reason: "must be at least 1",
            });
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "command_buffer",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
