//! The outbox entry record and its state machine.
//!
//! ```text
//!            mark_published
//!   PENDING ───────────────▶ PUBLISHED
//!      │  ▲                     ▲
//!      │  └──┐ record_failure   │ mark_published
//!      ▼     │ (retries left)   │
//!   FAILED ──┴──────────────────┘
//!      │
//!      └─ record_failure (exhausted or non-retryable) ─▶ DEAD_LETTER
//! ```
//!
//! PUBLISHED and DEAD_LETTER are terminal.

use crate::{EntryError, OutboxStatus};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;
use ulid::{Generator, Ulid};

/// A staged outbound event.
///
/// Fields are read-only outside the crate; state only moves through
/// [`mark_published`](Self::mark_published) and
/// [`record_failure`](Self::record_failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxEntry {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) aggregate_id: String,
    pub(crate) payload: String,
    pub(crate) headers: Option<String>,
    pub(crate) version: i64,
    pub(crate) status: OutboxStatus,
    pub(crate) error_message: Option<String>,
    pub(crate) retry_count: u32,
    pub(crate) retryable: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) retry_at: Option<DateTime<Utc>>,
    pub(crate) next_retry_at: DateTime<Utc>,
    pub(crate) published_at: Option<DateTime<Utc>>,
    pub(crate) dead_letter_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Build a new PENDING entry, due immediately.
    ///
    /// `topic` and `aggregate_id` are trimmed. `payload` must contain
    /// something other than whitespace but is stored as given.
    pub fn new(
        topic: &str,
        aggregate_id: &str,
        payload: String,
        headers: Option<String>,
        version: i64,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, EntryError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(EntryError::Validation("topic must not be blank".into()));
        }
        let aggregate_id = aggregate_id.trim();
        if aggregate_id.is_empty() {
            return Err(EntryError::Validation(
                "aggregate id must not be blank".into(),
            ));
        }
        if payload.trim().is_empty() {
            return Err(EntryError::Validation("payload must not be blank".into()));
        }
        if version < 0 {
            return Err(EntryError::Validation(format!(
                "version must be non-negative, got {version}"
            )));
        }

        let now = storage_precision(now);
        Ok(Self {
            id: next_id(),
            topic: topic.to_string(),
            aggregate_id: aggregate_id.to_string(),
            payload,
            headers,
            version,
            status: OutboxStatus::Pending,
            error_message: None,
            retry_count: 0,
            retryable,
            created_at: now,
            retry_at: None,
            next_retry_at: now,
            published_at: None,
            dead_letter_at: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Serialized header map, absent when the entry was created without headers.
    pub fn headers(&self) -> Option<&str> {
        self.headers.as_deref()
    }

    /// 0 for unordered entries, otherwise the 1-based position within the aggregate.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_ordered(&self) -> bool {
        self.version > 0
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the most recent failed attempt.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn dead_letter_at(&self) -> Option<DateTime<Utc>> {
        self.dead_letter_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a successful publish.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> Result<(), EntryError> {
        self.ensure_active(OutboxStatus::Published)?;
        self.status = OutboxStatus::Published;
        self.error_message = None;
        self.published_at = Some(storage_precision(now));
        Ok(())
    }

    /// Record a failed publish attempt and return the resulting status.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        initial_delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<OutboxStatus, EntryError> {
        self.record_failure_with_rng(
            error,
            max_retries,
            initial_delay,
            now,
            &mut rand::thread_rng(),
        )
    }

    /// [`record_failure`](Self::record_failure) with a caller-supplied jitter source.
    pub fn record_failure_with_rng<R: Rng + ?Sized>(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        initial_delay: Duration,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<OutboxStatus, EntryError> {
        let now = storage_precision(now);
        let retry_count = self.retry_count.saturating_add(1);
        let target = if !self.retryable || retry_count >= max_retries {
            OutboxStatus::DeadLetter
        } else {
            OutboxStatus::Failed
        };
        self.ensure_active(target)?;

        self.retry_count = retry_count;
        self.error_message = Some(error.into());
        self.retry_at = Some(now);
        self.status = target;

        match target {
            OutboxStatus::DeadLetter => self.dead_letter_at = Some(now),
            _ => {
                let delay = backoff_delay(retry_count, initial_delay, rng);
                self.next_retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .map(storage_precision)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
        }

        Ok(target)
    }

    fn ensure_active(&self, to: OutboxStatus) -> Result<(), EntryError> {
        if self.status.is_terminal() {
            return Err(EntryError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

/// Delay before attempt `retry_count + 1`:
/// `initial_delay * 2^(retry_count - 1)` plus uniform jitter in
/// `[0, initial_delay / 2]`, at millisecond resolution. Saturates rather
/// than overflowing.
pub fn backoff_delay<R: Rng + ?Sized>(
    retry_count: u32,
    initial_delay: Duration,
    rng: &mut R,
) -> Duration {
    let base_ms = u64::try_from(initial_delay.as_millis()).unwrap_or(u64::MAX);
    let shift = retry_count.saturating_sub(1);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let exponential = base_ms.saturating_mul(multiplier);
    let jitter = rng.gen_range(0..=base_ms / 2);
    Duration::from_millis(exponential.saturating_add(jitter))
}

/// ULIDs from one process sort in creation order even within a millisecond.
pub(crate) fn next_id() -> String {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    let mut generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new())).lock();
    generator
        .generate()
        .unwrap_or_else(|_| Ulid::new())
        .to_string()
}

/// Timestamps are persisted as integer microseconds.
pub(crate) fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}
