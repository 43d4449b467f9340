//! Configuration for the outbox processor and scheduler.

use crate::{ConfigError, ConfigResult, LogFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Topic used when a caller publishes without naming one.
pub const DEFAULT_TOPIC: &str = "outbox-events";

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Top-level outbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub log_format: LogFormat,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub publisher: PublisherConfig,
    pub ordering: OrderingConfig,
}

/// Scheduler and batch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// When false the scheduler starts no ticks.
    pub enabled: bool,
    /// Maximum entries claimed per cycle.
    pub batch_size: usize,
    pub publish_interval_ms: u64,
    pub retry_interval_ms: u64,
    /// How long a worker owns an entry it is publishing. Another worker may
    /// claim the entry again once this lapses. Must exceed
    /// `publisher.timeout_ms`.
    pub claim_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failures allowed before an entry is dead-lettered.
    pub max_retries: u32,
    /// Base of the exponential backoff.
    pub initial_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Adapter name, passed through to whoever builds the publisher.
    #[serde(rename = "type")]
    pub publisher_type: String,
    pub default_topic: String,
    /// Per-publish timeout for adapters. Not enforced by the engine.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// Let later versions proceed past a dead-lettered predecessor.
    pub skip_dead_lettered_predecessors: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::default(),
            processing: ProcessingConfig::default(),
            retry: RetryConfig::default(),
            publisher: PublisherConfig::default(),
            ordering: OrderingConfig::default(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: DEFAULT_BATCH_SIZE,
            publish_interval_ms: 10_000,
            retry_interval_ms: 30_000,
            claim_timeout_ms: 120_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 60_000,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_type: "logging".to_string(),
            default_topic: DEFAULT_TOPIC.to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl ProcessingConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl OutboxConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file if it exists, apply environment
    /// overrides, and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };

        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file without validating it.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every value against its allowed range.
    pub fn validate(&self) -> ConfigResult<()> {
        let batch_size = self.processing.batch_size;
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(ConfigError::Invalid(format!(
                "processing.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {batch_size}"
            )));
        }
        if self.processing.publish_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "processing.publish_interval_ms must be greater than 0".into(),
            ));
        }
        if self.processing.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "processing.retry_interval_ms must be greater than 0".into(),
            ));
        }

        let max_retries = self.retry.max_retries;
        if !(1..=MAX_RETRIES_LIMIT).contains(&max_retries) {
            return Err(ConfigError::Invalid(format!(
                "retry.max_retries must be between 1 and {MAX_RETRIES_LIMIT}, got {max_retries}"
            )));
        }

        if self.publisher.publisher_type.trim().is_empty() {
            return Err(ConfigError::Invalid("publisher.type must not be blank".into()));
        }
        if self.publisher.default_topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "publisher.default_topic must not be blank".into(),
            ));
        }
        if self.publisher.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "publisher.timeout_ms must be greater than 0".into(),
            ));
        }
        if self.processing.claim_timeout_ms <= self.publisher.timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "processing.claim_timeout_ms ({}) must exceed publisher.timeout_ms ({})",
                self.processing.claim_timeout_ms, self.publisher.timeout_ms
            )));
        }

        Ok(())
    }

    /// Override configuration from `OUTBOX_*` environment variables.
    fn load_from_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup("OUTBOX_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(raw) = lookup("OUTBOX_PROCESSING_ENABLED") {
            self.processing.enabled = parse_bool(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("OUTBOX_PROCESSING_ENABLED: not a boolean: {raw}"))
            })?;
        }
        if let Some(raw) = lookup("OUTBOX_BATCH_SIZE") {
            self.processing.batch_size = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("OUTBOX_BATCH_SIZE: not a number: {raw}"))
            })?;
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
