//! Transactional outbox: stage events in the caller's transaction, deliver
//! them later with retries and per-aggregate ordering.
//!
//! This crate provides:
//! - OutboxManager: fluent API for staging events plus health and metrics
//! - OutboxProcessor: entry creation and the pending/failed dispatch cycles
//! - OutboxScheduler: interval loops that drive the processor without overlap
//! - EventPublisher: the trait broker adapters implement
//!
//! Delivery is at-least-once. Entries with version 0 are unordered; entries
//! with version `n >= 1` are published only after every lower version of the
//! same aggregate has been published.

mod error;
mod manager;
mod metrics;
mod processor;
mod publisher;
mod scheduler;

pub use error::{OutboxError, OutboxResult};
pub use manager::{EventBuilder, OutboxManager};
pub use metrics::OutboxMetrics;
pub use processor::{CycleReport, OutboxProcessor, OutgoingMessage, ProcessorSettings, Queue};
pub use publisher::{EventPublisher, Headers, PublishError};
pub use scheduler::{OutboxScheduler, SchedulerHandle, SchedulerSettings, TickOutcome};
