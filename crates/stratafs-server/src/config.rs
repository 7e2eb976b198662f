//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use stratafs_core::{EngineConfig, SchedulerConfig};

use crate::error::{ServerError, ServerResult};
use crate::store::DEFAULT_MAX_OBJECT_SIZE;

/// Output format of the server's log lines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Object store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Largest size, in bytes, an object may be truncated or written to.
    pub max_object_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

/// Driver loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Maximum scheduler completions claimed per sweep.
    pub test_count: usize,
    /// Sweep tick in milliseconds.
    pub poll_interval_ms: u64,
    /// Period of the job timer machine.
    pub timer_interval_ms: u64,
    /// Period of the performance sampling machine.
    pub perf_interval_ms: u64,
    /// Initial number of performance samples kept.
    pub perf_history: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            test_count: 64,
            poll_interval_ms: 10,
            timer_interval_ms: 1000,
            perf_interval_ms: 1000,
            perf_history: 16,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in log lines.
    pub server_name: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Log line format.
    pub log_format: LogFormat,
    /// Request scheduler settings.
    pub scheduler: SchedulerConfig,
    /// State machine engine settings.
    pub engine: EngineConfig,
    /// Driver loop settings.
    pub driver: DriverConfig,
    /// Object store settings.
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: String::from("stratafs"),
            log_filter: String::from("info"),
            log_format: LogFormat::Text,
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            driver: DriverConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ServerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ServerError::UnsupportedConfigFormat(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.scheduler.max_requests == 0 {
            return Err(ServerError::InvalidConfig(
                "scheduler.max_requests must be non-zero".to_string(),
            ));
        }
        if self.engine.max_stack_depth == 0 {
            return Err(ServerError::InvalidConfig(
                "engine.max_stack_depth must be non-zero".to_string(),
            ));
        }
        if self.driver.test_count == 0 {
            return Err(ServerError::InvalidConfig(
                "driver.test_count must be non-zero".to_string(),
            ));
        }
        if self.driver.poll_interval_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "driver.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        // a zero period would re-arm the periodic machines inline forever
        if self.driver.timer_interval_ms == 0 || self.driver.perf_interval_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "driver timer and perf intervals must be non-zero".to_string(),
            ));
        }
        if self.store.max_object_size == 0 {
            return Err(ServerError::InvalidConfig(
                "store.max_object_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
