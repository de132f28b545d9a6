//! Dispatcher configuration.
//!
//! Loaded from YAML files and `DISPATCH__SECTION__KEY` environment variables.

use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "dispatch";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISPATCH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DISPATCH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISPATCH_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pop/ack endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7911,
        }
    }
}

impl ServerConfig {
    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the ack/error side channel.
    pub completion_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            completion_capacity: crate::queue::DEFAULT_COMPLETION_CAPACITY,
        }
    }
}

/// Where job claims are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStorage {
    /// Process-local; only deduplicates within one process.
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReducerConfig {
    pub enabled: bool,
    pub storage: ClaimStorage,
    /// SQLite database file shared by every replica.
    pub sqlite_path: String,
    /// How long a claim stays valid after it is made.
    pub validity_secs: u64,
    /// Minimum age before an expired claim is reaped.
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: ClaimStorage::default(),
            sqlite_path: "./data/claims.db".to_string(),
            validity_secs: crate::reducer::DEFAULT_VALIDITY.as_secs(),
            retention_secs: 24 * 60 * 60,
            reap_interval_secs: crate::reducer::reaper::DEFAULT_REAP_INTERVAL.as_secs(),
        }
    }
}

impl ReducerConfig {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA timezone for subscriptions that do not name one.
    pub default_timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.default_timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone '{}'", self.default_timezone)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub debounce_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            debounce_ms: crate::enqueuer::system::DEFAULT_DEBOUNCE.as_millis() as u64,
        }
    }
}

impl SystemConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// How long a request waits for its worker before answering 504.
    pub response_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: crate::enqueuer::http::DEFAULT_RESPONSE_TIMEOUT.as_secs(),
        }
    }
}

impl HttpConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Capacity of the handoff between change streams and the dispatch loop.
    pub signal_buffer: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            signal_buffer: crate::enqueuer::database::DEFAULT_SIGNAL_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Broker URL for subscriptions that do not name one.
    pub default_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Identity of this replica; generated when absent.
    pub replica_id: Option<String>,
}

/// Main dispatcher configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub reducer: ReducerConfig,
    pub schedule: ScheduleConfig,
    pub system: SystemConfig,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub message_queue: MessageQueueConfig,
    pub replication: ReplicationConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `dispatch.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder =
            ConfigLib::builder().add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that deserialize but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.timezone()?;
        if self.reducer.validity_secs == 0 {
            return Err(ConfigError::Invalid("reducer.validity_secs must be positive".to_string()));
        }
        if self.queue.completion_capacity == 0 {
            return Err(ConfigError::Invalid("queue.completion_capacity must be positive".to_string()));
        }
        if self.http.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http.response_timeout_secs must be positive".to_string()));
        }
        if self.database.signal_buffer == 0 {
            return Err(ConfigError::Invalid("database.signal_buffer must be positive".to_string()));
        }
        Ok(())
    }

    /// Create config for testing: in-memory claims, ephemeral port.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.reducer.storage = ClaimStorage::Memory;
        config
    }
}
