//! Pipeline configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.flowtrace.toml`)
//! 2. Environment variables (with `FLOWTRACE_` prefix)
//!
//! Environment variables override TOML configuration. Every component takes
//! its section by value or reference at construction; nothing reads the
//! configuration globally.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [mq]
//! backend = "redis"
//! host = "localhost"
//! port = 6379
//! channel = "interception"
//!
//! [db]
//! backend = "memory"
//! correlation_key = "task_id"
//!
//! [inserter]
//! max_buffer_size = 50
//! max_flush_interval_ms = 5000
//!
//! [log]
//! level = "info"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::channel::ReconnectPolicy;
use crate::codec::DEFAULT_MAX_MESSAGE_BYTES;
use crate::message::DEFAULT_CORRELATION_KEY;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = ".flowtrace.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FLOWTRACE_";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading a configuration file.
    #[error("failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Broker backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqBackend {
    /// In-process broadcast bus.
    #[default]
    Local,
    /// Redis pub/sub.
    Redis,
    /// Kafka topic with a consumer group.
    Kafka,
}

impl fmt::Display for MqBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Redis => write!(f, "redis"),
            Self::Kafka => write!(f, "kafka"),
        }
    }
}

impl FromStr for MqBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            "kafka" => Ok(Self::Kafka),
            other => Err(ConfigError::Invalid(format!("unknown mq backend: {other}"))),
        }
    }
}

/// Document store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    /// In-process `DashMap`.
    #[default]
    Memory,
    /// Redis hashes.
    Redis,
}

impl fmt::Display for DbBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for DbBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::Invalid(format!("unknown db backend: {other}"))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Message broker.
    pub mq: MqConfig,
    /// Document store.
    pub db: DbConfig,
    /// Buffered inserter thresholds.
    pub inserter: InserterConfig,
    /// Producer-side buffering.
    pub emitter: EmitterConfig,
    /// Logging.
    pub log: LogConfig,
}

/// Message broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// Backend selection.
    pub backend: MqBackend,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Channel (or topic) carrying task messages.
    pub channel: String,
    /// Kafka consumer group.
    pub consumer_group: String,
    /// Per-message size limit in bytes.
    pub max_message_bytes: usize,
    /// Receive poll timeout in milliseconds.
    pub poll_timeout_ms: u64,
    /// Consecutive transient failures tolerated by the listen loop.
    pub reconnect_max_retries: u32,
    /// Fixed backoff between reconnect attempts in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Per-channel buffer of the local backend.
    pub local_capacity: usize,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            backend: MqBackend::Local,
            host: "localhost".to_string(),
            port: 6379,
            channel: "interception".to_string(),
            consumer_group: "flowtrace".to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            poll_timeout_ms: 1000,
            reconnect_max_retries: 3,
            reconnect_backoff_ms: 3000,
            local_capacity: 4096,
        }
    }
}

impl MqConfig {
    /// Receive poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Reconnect policy for listen loops.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_max_retries,
            Duration::from_millis(self.reconnect_backoff_ms),
        )
    }

    /// `host:port` of the broker.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Document store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Backend selection.
    pub backend: DbBackend,
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Key prefix isolating this deployment's records.
    pub key_prefix: String,
    /// Field carrying the unique correlation key.
    pub correlation_key: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: DbBackend::Memory,
            host: "localhost".to_string(),
            port: 6379,
            key_prefix: "flowtrace".to_string(),
            correlation_key: DEFAULT_CORRELATION_KEY.to_string(),
        }
    }
}

impl DbConfig {
    /// Redis connection URL.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Buffered inserter thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InserterConfig {
    /// Flush when this many messages are buffered.
    pub max_buffer_size: usize,
    /// Flush when this much time passed since the previous flush.
    pub max_flush_interval_ms: u64,
    /// Grace period the consumer waits before signalling stop.
    pub stop_grace_ms: u64,
}

impl Default for InserterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 50,
            max_flush_interval_ms: 5000,
            stop_grace_ms: 1000,
        }
    }
}

impl InserterConfig {
    /// Time threshold as a [`Duration`].
    pub fn max_flush_interval(&self) -> Duration {
        Duration::from_millis(self.max_flush_interval_ms)
    }

    /// Stop grace period as a [`Duration`].
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Producer-side buffering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Messages buffered before a bulk publish; `1` publishes each message.
    pub buffer_size: usize,
    /// Flush a non-empty buffer on emit once this much time has passed.
    pub flush_interval_ms: u64,
    /// Flush events kept for diagnostics.
    pub history_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            flush_interval_ms: 5000,
            history_capacity: 256,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level directive when `RUST_LOG` is unset.
    pub level: String,
    /// Colourised output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl FlowConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `.flowtrace.toml` in the working directory
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but does not parse, or the
    /// result fails [`validate`](Self::validate).
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// result fails [`validate`](Self::validate).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or mistyped values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `FLOWTRACE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        override_parsed(&var, "MQ_BACKEND", &mut self.mq.backend);
        if let Some(host) = var("MQ_HOST") {
            self.mq.host = host;
        }
        override_parsed(&var, "MQ_PORT", &mut self.mq.port);
        if let Some(channel) = var("MQ_CHANNEL") {
            self.mq.channel = channel;
        }
        if let Some(group) = var("MQ_CONSUMER_GROUP") {
            self.mq.consumer_group = group;
        }

        override_parsed(&var, "DB_BACKEND", &mut self.db.backend);
        if let Some(host) = var("DB_HOST") {
            self.db.host = host;
        }
        override_parsed(&var, "DB_PORT", &mut self.db.port);
        if let Some(key) = var("DB_CORRELATION_KEY") {
            self.db.correlation_key = key;
        }

        override_parsed(&var, "INSERTER_MAX_BUFFER_SIZE", &mut self.inserter.max_buffer_size);
        override_parsed(
            &var,
            "INSERTER_MAX_FLUSH_INTERVAL_MS",
            &mut self.inserter.max_flush_interval_ms,
        );
        override_parsed(&var, "EMITTER_BUFFER_SIZE", &mut self.emitter.buffer_size);

        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Rejects values that would stall or break the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.mq.channel.is_empty() {
            return invalid("mq.channel must not be empty");
        }
        if self.mq.poll_timeout_ms == 0 {
            return invalid("mq.poll_timeout_ms must be positive");
        }
        if self.mq.max_message_bytes == 0 {
            return invalid("mq.max_message_bytes must be positive");
        }
        if self.db.correlation_key.is_empty() {
            return invalid("db.correlation_key must not be empty");
        }
        if self.inserter.max_buffer_size == 0 {
            return invalid("inserter.max_buffer_size must be positive");
        }
        if self.emitter.buffer_size == 0 {
            return invalid("emitter.buffer_size must be positive");
        }
        Ok(())
    }
}

fn override_parsed<T, F>(var: &F, suffix: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(suffix) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(variable = %format!("{ENV_PREFIX}{suffix}"), value = %raw, "ignoring unparsable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FlowConfig::default();
        assert_eq!(config.mq.backend, MqBackend::Local);
        assert_eq!(config.mq.channel, "interception");
        assert_eq!(config.mq.reconnect_max_retries, 3);
        assert_eq!(config.mq.reconnect_backoff_ms, 3000);
        assert_eq!(config.db.correlation_key, "task_id");
        assert_eq!(config.inserter.max_buffer_size, 50);
        assert_eq!(config.inserter.max_flush_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            [mq]
            backend = "kafka"
            host = "broker"
            port = 9092
            channel = "tasks"

            [inserter]
            max_buffer_size = 5
            max_flush_interval_ms = 2000
        "#;

        let config = FlowConfig::from_toml(toml).unwrap();
        assert_eq!(config.mq.backend, MqBackend::Kafka);
        assert_eq!(config.mq.address(), "broker:9092");
        assert_eq!(config.mq.channel, "tasks");
        assert_eq!(config.mq.consumer_group, "flowtrace");
        assert_eq!(config.inserter.max_buffer_size, 5);
        assert_eq!(config.db, DbConfig::default());
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        let result = FlowConfig::from_toml("[mq]\nbackend = \"carrier-pigeon\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("FLOWTRACE_MQ_BACKEND", "redis"),
            ("FLOWTRACE_MQ_PORT", "6380"),
            ("FLOWTRACE_DB_CORRELATION_KEY", "run_id"),
            ("FLOWTRACE_INSERTER_MAX_BUFFER_SIZE", "not-a-number"),
            ("FLOWTRACE_LOG_LEVEL", "debug"),
        ]);
        let mut config = FlowConfig::default();
        config.apply_overrides(|name| vars.get(name).map(ToString::to_string));

        assert_eq!(config.mq.backend, MqBackend::Redis);
        assert_eq!(config.mq.port, 6380);
        assert_eq!(config.db.correlation_key, "run_id");
        assert_eq!(config.inserter.max_buffer_size, 50);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = FlowConfig::default();
        config.inserter.max_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowtrace.toml");
        std::fs::write(&path, "[db]\nkey_prefix = \"test\"\n").unwrap();
        let config = FlowConfig::from_file(&path).unwrap();
        assert_eq!(config.db.key_prefix, "test");
    }

    #[test]
    fn test_from_missing_file() {
        let result = FlowConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_backend_round_trip_through_display() {
        for backend in [MqBackend::Local, MqBackend::Redis, MqBackend::Kafka] {
            assert_eq!(backend.to_string().parse::<MqBackend>().unwrap(), backend);
        }
        assert_eq!("REDIS".parse::<DbBackend>().unwrap(), DbBackend::Redis);
    }
}
