//! Configuration and logging setup for the outbox.

mod config;
mod error;
mod logging;

pub use config::{
    OrderingConfig, OutboxConfig, ProcessingConfig, PublisherConfig, RetryConfig,
    DEFAULT_BATCH_SIZE, DEFAULT_LOG_LEVEL, DEFAULT_TOPIC, MAX_BATCH_SIZE, MAX_RETRIES_LIMIT,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level, LogFormat};
