//! File-based configuration.
//!
//! Every section is optional; missing fields fall back to their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::detector::DetectorConfig;
use crate::error::ConfigError;
use crate::registry::RegistryConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Shard worker threads. `0` = one per available core.
    pub shards: usize,
    /// Bounded queue depth per shard.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            shards: 0,
            queue_capacity: 100_000,
        }
    }
}

impl ServerConfig {
    pub fn effective_shards(&self) -> usize {
        if self.shards > 0 {
            return self.shards;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector.validate()?;
        if self.registry.max_streams == 0 {
            return Err(ConfigError::Server(
                "registry.max_streams must be at least 1".to_string(),
            ));
        }
        if self.server.queue_capacity == 0 {
            return Err(ConfigError::Server(
                "server.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
