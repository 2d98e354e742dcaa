//! Configuration: the broker definition file and process settings.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

use crate::error::{BrokerError, BrokerResult};

/// Default capacity of the broker event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Process-level settings for the `jobbroker` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Path to the broker definition file.
    #[serde(default)]
    pub broker_config: Option<String>,
    /// Capacity of the broker event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

const fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl AppConfig {
    /// Load process settings from files and environment variables.
    ///
    /// Settings are loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `JOBBROKER_ENV`)
    /// 3. Environment variables with `JOBBROKER_` prefix (e.g. `JOBBROKER_BROKER_CONFIG`)
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("JOBBROKER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("JOBBROKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

/// The broker definition file as written by the user.
///
/// Every node is optional here: presence and shape are checked one by one by
/// the bootstrap so each problem maps to its own error code.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerFile {
    /// Worker entries, in declaration order.
    #[serde(default)]
    pub workers: Option<Vec<WorkerEntry>>,
}

/// One `(job-type, worker, queue)` declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerEntry {
    /// Job type handled by this entry.
    #[serde(rename = "job-type", default)]
    pub job_type: Option<String>,
    /// Worker node.
    #[serde(default)]
    pub worker: Option<WorkerNode>,
    /// Queue node.
    #[serde(default)]
    pub queue: Option<QueueNode>,
}

/// The `worker` node of an entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerNode {
    /// Name of the worker module.
    #[serde(rename = "worker-module", default)]
    pub module: Option<String>,
    /// Opaque settings handed to the worker factory.
    #[serde(rename = "worker-settings", default)]
    pub settings: Value,
}

/// The `queue` node of an entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueNode {
    /// Name of the queue module (backend kind).
    #[serde(rename = "queue-module", default)]
    pub module: Option<String>,
    /// Name of the backend queue.
    #[serde(rename = "queue-name", default)]
    pub name: Option<String>,
    /// Opaque settings handed to the queue factory.
    #[serde(rename = "queue-settings", default)]
    pub settings: Value,
}

impl BrokerFile {
    /// Load a broker definition from a JSON file.
    ///
    /// A missing path (or a directory) maps to `FILE_NOT_FOUND`; anything the
    /// JSON reader rejects maps to `JSON_PARSE_ERROR`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> BrokerResult<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        match std::fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => {}
            _ => return Err(BrokerError::ConfigFileNotFound(display)),
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .build()
            .map_err(|e| BrokerError::ConfigJsonParse(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| BrokerError::ConfigJsonParse(e.to_string()))
    }
}

/// Returns the string value of an optional node when it is present and not blank.
#[must_use]
pub fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}
