//! Typed configuration for bus connectors
//!
//! Loaded from TOML. The top level names the environment, agent and local
//! scratch folder; `[mqtt]` configures the notification channel and `[ftp]`
//! the content store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest payload a single MQTT PUBLISH can carry
pub const MQTT_MAX_PAYLOAD: usize = 268_435_455;

/// Complete connector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Modelling environment ID
    pub environment: String,
    /// Agent ID used for postings
    pub agent: String,
    /// Local scratch-file directory
    pub work_folder: PathBuf,
    /// Notification channel settings
    pub mqtt: EventsConfig,
    /// Content store settings
    pub ftp: RepositoryConfig,
}

/// Notification channel (`[mqtt]`) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub prefix: String,
    /// Settle delay for retained messages to arrive, in milliseconds
    #[serde(default = "default_load_delay_ms")]
    pub load_delay_ms: u64,
    /// Backoff between connection attempts, in seconds
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Largest payload accepted for inline (streamed) postings, in bytes
    #[serde(default = "default_streamed_payload_limit")]
    pub streamed_payload_limit: usize,
    /// Abort the process when an established connection drops
    #[serde(default = "default_true")]
    pub abort_on_connection_loss: bool,
}

/// Content store (`[ftp]`) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub server: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub prefix: String,
    /// All agents share one statically configured server
    #[serde(default)]
    pub single_server_mode: bool,
    /// Use active rather than passive transfers
    #[serde(default)]
    pub active_transfers: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_ftp_port() -> u16 {
    21
}

fn default_load_delay_ms() -> u64 {
    1000
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_streamed_payload_limit() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

impl EventsConfig {
    /// Settle delay as a duration
    #[inline]
    #[must_use]
    pub fn load_delay(&self) -> Duration {
        Duration::from_millis(self.load_delay_ms)
    }

    /// Connection retry backoff as a duration
    #[inline]
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl BusConfig {
    /// Parse configuration from a TOML string and validate it
    ///
    /// # Errors
    /// Returns error if parsing or validation fails
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges and required fields
    ///
    /// # Errors
    /// Returns the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_empty() {
            return Err(ConfigError::Missing("environment"));
        }
        if self.agent.is_empty() {
            return Err(ConfigError::Missing("agent"));
        }
        if self.work_folder.as_os_str().is_empty() {
            return Err(ConfigError::Missing("work_folder"));
        }
        if self.mqtt.broker.is_empty() {
            return Err(ConfigError::Missing("mqtt.broker"));
        }
        if self.ftp.server.is_empty() {
            return Err(ConfigError::Missing("ftp.server"));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid {
                key: "mqtt.port",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.ftp.port == 0 {
            return Err(ConfigError::Invalid {
                key: "ftp.port",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.mqtt.streamed_payload_limit == 0
            || self.mqtt.streamed_payload_limit > MQTT_MAX_PAYLOAD
        {
            return Err(ConfigError::Invalid {
                key: "mqtt.streamed_payload_limit",
                reason: format!("must be within 1..={MQTT_MAX_PAYLOAD}"),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Required key empty or absent
    #[error("missing required config value: {0}")]
    Missing(&'static str),

    /// Value out of range
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
