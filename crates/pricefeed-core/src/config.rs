//! Configuration management.
//!
//! Values come from `config.json` under the base directory (defaults when the
//! file is missing), then environment variables override individual fields.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default broker topic for price update events.
pub const DEFAULT_BROKER_TOPIC: &str = "token-price-updates";

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Database location; defaults to `Paths::database_file()`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub outbox: OutboxSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_path: None,
            circuit_breaker: CircuitBreakerSettings::default(),
            outbox: OutboxSettings::default(),
            sync: SyncSettings::default(),
            broker: BrokerSettings::default(),
        }
    }
}

/// Circuit breaker settings for the price source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            success_threshold: 3,
            timeout_ms: 5_000,
        }
    }
}

/// Outbox dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub processing_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    /// PROCESSING events older than this are failed and retried.
    pub processing_timeout_ms: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            processing_interval_ms: 1_000,
            retry_interval_ms: 30_000,
            max_retries: 3,
            processing_timeout_ms: 300_000,
        }
    }
}

/// Price sync loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_seconds: u64,
    pub batch_size: usize,
    pub threshold_percent: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            batch_size: 5,
            threshold_percent: 0.1,
        }
    }
}

/// Message broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub redis_url: String,
    pub topic: String,
    /// Per-publish send timeout.
    pub send_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            topic: DEFAULT_BROKER_TOPIC.to_string(),
            send_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from the base directory, falling back to defaults,
    /// then apply environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the base directory.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Resolve the database file location.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(level) = std::env::var("PRICEFEED_LOG_LEVEL") {
            self.log_level = level;
        }

        let sync = &mut self.sync;
        override_from_env("PRICE_UPDATE_INTERVAL_SECONDS", &mut sync.interval_seconds);
        override_from_env("PRICE_UPDATE_BATCH_SIZE", &mut sync.batch_size);
        override_from_env("PRICE_UPDATE_THRESHOLD_PERCENT", &mut sync.threshold_percent);

        let cb = &mut self.circuit_breaker;
        override_from_env("PRICE_SERVICE_FAILURE_THRESHOLD", &mut cb.failure_threshold);
        override_from_env("PRICE_SERVICE_RECOVERY_TIMEOUT_MS", &mut cb.recovery_timeout_ms);
        override_from_env("PRICE_SERVICE_SUCCESS_THRESHOLD", &mut cb.success_threshold);
        override_from_env("PRICE_SERVICE_TIMEOUT_MS", &mut cb.timeout_ms);

        let outbox = &mut self.outbox;
        override_from_env("OUTBOX_BATCH_SIZE", &mut outbox.batch_size);
        override_from_env("OUTBOX_PROCESSING_INTERVAL_MS", &mut outbox.processing_interval_ms);
        override_from_env("OUTBOX_PROCESSING_TIMEOUT_MS", &mut outbox.processing_timeout_ms);
        override_from_env("OUTBOX_RETRY_INTERVAL_MS", &mut outbox.retry_interval_ms);
        override_from_env("OUTBOX_MAX_RETRIES", &mut outbox.max_retries);

        if let Ok(url) = std::env::var("REDIS_URL") {
            self.broker.redis_url = url;
        }
        if let Ok(topic) = std::env::var("BROKER_TOPIC") {
            self.broker.topic = topic;
        }
    }

    /// Reject values that would stall or spin the periodic loops.
    pub fn validate(&self) -> CoreResult<()> {
        let checks: [(bool, &str); 12] = [
            (self.sync.interval_seconds > 0, "sync.interval_seconds must be > 0"),
            (self.sync.batch_size > 0, "sync.batch_size must be > 0"),
            (
                (0.0..=100.0).contains(&self.sync.threshold_percent),
                "sync.threshold_percent must be between 0 and 100",
            ),
            (self.outbox.batch_size > 0, "outbox.batch_size must be > 0"),
            (
                self.outbox.processing_interval_ms > 0,
                "outbox.processing_interval_ms must be > 0",
            ),
            (self.outbox.retry_interval_ms > 0, "outbox.retry_interval_ms must be > 0"),
            (
                self.outbox.processing_timeout_ms > 0,
                "outbox.processing_timeout_ms must be > 0",
            ),
            (
                self.circuit_breaker.failure_threshold > 0,
                "circuit_breaker.failure_threshold must be > 0",
            ),
            (
                self.circuit_breaker.success_threshold > 0,
                "circuit_breaker.success_threshold must be > 0",
            ),
            (self.circuit_breaker.timeout_ms > 0, "circuit_breaker.timeout_ms must be > 0"),
            (!self.broker.topic.is_empty(), "broker.topic must not be empty"),
            (self.broker.send_timeout_ms > 0, "broker.send_timeout_ms must be > 0"),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(CoreError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable environment override"),
    }
}
