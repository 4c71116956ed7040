//! Server configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `iot.{toml,json,yaml}` file (explicit path, `~/.iotserver/` or the working
//! directory), then `IOTEDGE_*` environment variables using `__` as the
//! nesting separator (`IOTEDGE_FLUSH__PERIOD_SECS=10`).

use iotedge_shared::protocol::{http::HTTP_PORT, mqtt::MQTT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_STEM: &str = "iot";
const CONFIG_DIR: &str = ".iotserver";
const ENV_PREFIX: &str = "IOTEDGE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to write configuration to {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Listen address for the ingestion HTTP API
    pub http_addr: String,

    /// Admin HTTP listen address (health checks + metrics)
    pub admin_addr: String,

    /// TCP port of the embedded MQTT broker
    pub mqtt_port: u16,

    /// Forward flushed batches to another server instead of the local sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_redirect_address: Option<String>,

    /// Storage backend configuration
    pub storage: StorageConfig,

    pub flush: FlushConfig,

    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Device registry and measurements in one SQLite file
    Sqlite { path: String },
    /// Everything in process memory (lost on exit)
    Memory,
    /// Measurements in ClickHouse, device registry in SQLite
    #[serde(rename = "clickhouse")]
    ClickHouse {
        endpoint: String,
        database: String,
        registry_path: String,
    },
}

/// Timing of the flush cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub period_secs: u64,
    pub settle_secs: u64,
    /// Stop retrying once less than this remains before the next deadline
    pub safety_margin_secs: u64,
    pub retry_backoff_ms: u64,
    /// Time one series may spend retrying before it is dropped
    pub series_budget_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub ping_interval_secs: u64,
    /// Delay between subscriber connection attempts
    pub connect_retry_ms: u64,
    /// Upper bound on concurrently running routing tasks
    pub max_inflight_routes: usize,
    pub max_payload_size: usize,
    pub max_connections: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            http_addr: format!("0.0.0.0:{}", HTTP_PORT),
            admin_addr: "0.0.0.0:9090".to_string(),
            mqtt_port: MQTT_PORT,
            mqtt_redirect_address: None,
            storage: StorageConfig::Sqlite {
                path: "./iot.db".to_string(),
            },
            flush: FlushConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            period_secs: 30,
            settle_secs: 5,
            safety_margin_secs: 2,
            retry_backoff_ms: 50,
            series_budget_ms: 2000,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            connect_retry_ms: 1000,
            max_inflight_routes: 64,
            max_payload_size: 20 * 1024,
            max_connections: 1024,
        }
    }
}

impl FlushConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn series_budget(&self) -> Duration {
        Duration::from_millis(self.series_budget_ms)
    }
}

impl BrokerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl EdgeConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// With `path == None` the file is looked up in `~/.iotserver/` and the
    /// working directory and may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&EdgeConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(home) = std::env::var_os("HOME") {
                    let in_home = PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE_STEM);
                    builder = builder.add_source(
                        config::File::with_name(&in_home.to_string_lossy()).required(false),
                    );
                }
                builder = builder.add_source(config::File::with_name(CONFIG_FILE_STEM).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EdgeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the flush scheduler cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let flush = &self.flush;
        if flush.period_secs == 0 {
            return Err(ConfigError::Invalid("flush.period_secs must be greater than 0".into()));
        }
        if flush.safety_margin_secs >= flush.period_secs {
            return Err(ConfigError::Invalid(format!(
                "flush.safety_margin_secs ({}) must be smaller than flush.period_secs ({})",
                flush.safety_margin_secs, flush.period_secs
            )));
        }
        if flush.settle_secs >= flush.period_secs {
            return Err(ConfigError::Invalid(format!(
                "flush.settle_secs ({}) must be smaller than flush.period_secs ({})",
                flush.settle_secs, flush.period_secs
            )));
        }
        if flush.series_budget_ms == 0 {
            return Err(ConfigError::Invalid("flush.series_budget_ms must be greater than 0".into()));
        }
        if self.broker.max_inflight_routes == 0 {
            return Err(ConfigError::Invalid("broker.max_inflight_routes must be greater than 0".into()));
        }
        Ok(())
    }

    /// Redirect target, treating an empty string as unset.
    pub fn redirect_target(&self) -> Option<&str> {
        self.mqtt_redirect_address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Write the default configuration as TOML, refusing to overwrite.
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };
        if path.exists() {
            return Err(write_err("file already exists".into()));
        }
        let text = toml::to_string_pretty(&EdgeConfig::default()).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        std::fs::write(path, text).map_err(|e| write_err(e.to_string()))
    }
}
