//! Configuration loader and validator for the search sync job.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub database: Database,
    pub elasticsearch: Elasticsearch,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub broker: Option<Broker>,
}

/// Metadata store holding the records to mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub url: String,
}

/// Search index settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Elasticsearch {
    pub url: String,
    pub index: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,
}

/// Scheduling and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub connect_attempts: u32,
    pub connect_wait_seconds: u64,
    pub queue_capacity: usize,
    pub max_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 40,
            connect_wait_seconds: 3,
            queue_capacity: 32,
            max_attempts: 5,
        }
    }
}

/// Job table used when work is handed to out-of-process workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_bulk_chunk_size() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_interval_ms() -> u64 {
    2000
}

impl Config {
    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.sync.connect_wait_seconds)
    }

    /// Database URL, with `DATABASE_URL` taking precedence over the file.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database.url.clone())
    }

    /// Broker URL, with `BROKER_URL` taking precedence over the file.
    pub fn broker_url(&self) -> Option<String> {
        std::env::var("BROKER_URL")
            .ok()
            .or_else(|| self.broker.as_ref().map(|b| b.url.clone()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }

    if cfg.elasticsearch.url.trim().is_empty() {
        return Err(ConfigError::Invalid("elasticsearch.url must be non-empty"));
    }
    if cfg.elasticsearch.index.trim().is_empty() {
        return Err(ConfigError::Invalid("elasticsearch.index must be non-empty"));
    }
    if cfg.elasticsearch.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("elasticsearch.timeout_seconds must be > 0"));
    }
    if cfg.elasticsearch.bulk_chunk_size == 0 {
        return Err(ConfigError::Invalid("elasticsearch.bulk_chunk_size must be > 0"));
    }

    if cfg.sync.connect_attempts == 0 {
        return Err(ConfigError::Invalid("sync.connect_attempts must be > 0"));
    }
    if cfg.sync.queue_capacity == 0 {
        return Err(ConfigError::Invalid("sync.queue_capacity must be > 0"));
    }
    if cfg.sync.max_attempts == 0 {
        return Err(ConfigError::Invalid("sync.max_attempts must be > 0"));
    }

    if let Some(broker) = &cfg.broker {
        if broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.url must be non-empty"));
        }
        if broker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("broker.poll_interval_ms must be > 0"));
        }
        if broker.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid("broker.progress_interval_ms must be > 0"));
        }
    }

    Ok(())
}

/// Returns an example YAML config covering every section.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./metadata.db"

elasticsearch:
  url: "http://127.0.0.1:9200"
  index: "pacifica_search"
  timeout_seconds: 60
  bulk_chunk_size: 500

sync:
  connect_attempts: 40
  connect_wait_seconds: 3
  queue_capacity: 32
  max_attempts: 5

broker:
  url: "sqlite://./broker.db"
  poll_interval_ms: 500
  progress_interval_ms: 2000
"#
}
