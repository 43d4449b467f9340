//! Entry creation and batch dispatch.
//!
//! A cycle samples the clock once and selects a batch of eligible entries
//! under a [`LockedTransaction`]. Each entry is then claimed in a short locked
//! transaction, published with no transaction open, and its outcome committed
//! in a second short one. The write lock is never held across a publish.
//! A failure partway through a batch never undoes the transitions already
//! committed. A crash after claiming leaves the entry to be picked up again
//! once its claim lapses, so that one entry may be delivered twice.

use crate::{EventPublisher, Headers, OutboxError, OutboxMetrics, OutboxResult};
use chrono::{DateTime, Utc};
use outbox_config::OutboxConfig;
use outbox_store::{
    queries, Database, DatabaseError, LockedTransaction, OrderingPolicy, OutboxEntry,
    OutboxStatus,
};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables for a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub ordering: OrderingPolicy,
    /// Lease taken on an entry while it is being published.
    pub claim_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

impl ProcessorSettings {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            batch_size: config.processing.batch_size,
            max_retries: config.retry.max_retries,
            initial_delay: config.retry.initial_delay(),
            ordering: OrderingPolicy::from_skip_dead_letter(
                config.ordering.skip_dead_lettered_predecessors,
            ),
            claim_timeout: config.processing.claim_timeout(),
        }
    }
}

/// The two dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Pending,
    Failed,
}

impl Queue {
    pub fn status(&self) -> OutboxStatus {
        match self {
            Self::Pending => OutboxStatus::Pending,
            Self::Failed => OutboxStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event to stage, before serialization.
#[derive(Debug)]
pub struct OutgoingMessage<'a, P: ?Sized> {
    pub topic: &'a str,
    pub aggregate_id: &'a str,
    pub payload: &'a P,
    pub headers: &'a Headers,
    pub retryable: bool,
    /// Allocate the next per-aggregate version instead of version 0.
    pub ordered: bool,
}

/// What one processing cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Selected but no longer eligible when re-read under lock.
    pub skipped: usize,
    /// Published or failed after the claim had lapsed and been taken over,
    /// so the outcome was not recorded.
    pub lost_claims: usize,
}

/// Creates entries and drives them through dispatch.
///
/// Each queue has its own connection. Cycles only hold the database write
/// lock for the short claim and completion transactions, never while the
/// publisher runs.
pub struct OutboxProcessor {
    pending_conn: Mutex<Connection>,
    failed_conn: Mutex<Connection>,
    read_conn: Mutex<Connection>,
    publisher: Arc<dyn EventPublisher>,
    settings: ProcessorSettings,
}

impl OutboxProcessor {
    pub fn new(
        db: &Database,
        publisher: Arc<dyn EventPublisher>,
        settings: ProcessorSettings,
    ) -> OutboxResult<Self> {
        info!(
            publisher_type = publisher.publisher_type(),
            batch_size = settings.batch_size,
            max_retries = settings.max_retries,
            initial_delay_ms = u64::try_from(settings.initial_delay.as_millis()).unwrap_or(u64::MAX),
            claim_timeout_ms = u64::try_from(settings.claim_timeout.as_millis()).unwrap_or(u64::MAX),
            ordering = ?settings.ordering,
            "Creating outbox processor"
        );
        Ok(Self {
            pending_conn: Mutex::new(db.connect()?),
            failed_conn: Mutex::new(db.connect()?),
            read_conn: Mutex::new(db.connect()?),
            publisher,
            settings,
        })
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    // ==========================================
    // Creation
    // ==========================================

    /// Stage an event inside the caller's transaction.
    ///
    /// Nothing is committed here; the entry becomes visible to dispatch only
    /// when the caller commits. Ordered messages get `max(version) + 1` for
    /// their aggregate, or 1 for the first, allocated by the insert itself.
    pub fn create<P>(
        &self,
        tx: &Transaction<'_>,
        message: OutgoingMessage<'_, P>,
    ) -> OutboxResult<OutboxEntry>
    where
        P: Serialize + ?Sized,
    {
        let topic = message.topic.trim();
        if topic.is_empty() {
            return Err(OutboxError::Validation("topic must not be blank".into()));
        }
        let aggregate_id = message.aggregate_id.trim();
        if aggregate_id.is_empty() {
            return Err(OutboxError::Validation(
                "aggregate id must not be blank".into(),
            ));
        }

        let payload = serde_json::to_string(message.payload).map_err(OutboxError::Serialization)?;
        let headers = if message.headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(message.headers).map_err(OutboxError::Serialization)?)
        };

        let mut entry = OutboxEntry::new(
            topic,
            aggregate_id,
            payload,
            headers,
            0,
            message.retryable,
            Utc::now(),
        )?;
        if message.ordered {
            queries::insert_ordered_entry(tx, &mut entry)?;
        } else {
            queries::insert_entry(tx, &entry)?;
        }

        debug!(
            entry_id = %entry.id(),
            topic = %entry.topic(),
            aggregate_id = %entry.aggregate_id(),
            version = entry.version(),
            "Staged outbox entry"
        );
        Ok(entry)
    }

    // ==========================================
    // Dispatch
    // ==========================================

    pub fn process_pending(&self) -> OutboxResult<CycleReport> {
        self.process_pending_at(Utc::now())
    }

    /// Run a pending cycle as if the clock read `now`.
    pub fn process_pending_at(&self, now: DateTime<Utc>) -> OutboxResult<CycleReport> {
        self.run_cycle(Queue::Pending, now)
    }

    pub fn process_failed(&self) -> OutboxResult<CycleReport> {
        self.process_failed_at(Utc::now())
    }

    /// Run a retry cycle as if the clock read `now`.
    pub fn process_failed_at(&self, now: DateTime<Utc>) -> OutboxResult<CycleReport> {
        self.run_cycle(Queue::Failed, now)
    }

    pub fn process(&self, queue: Queue) -> OutboxResult<CycleReport> {
        match queue {
            Queue::Pending => self.process_pending(),
            Queue::Failed => self.process_failed(),
        }
    }

    fn run_cycle(&self, queue: Queue, now: DateTime<Utc>) -> OutboxResult<CycleReport> {
        let policy = self.settings.ordering;
        let mut conn = match queue {
            Queue::Pending => self.pending_conn.lock(),
            Queue::Failed => self.failed_conn.lock(),
        };

        let candidates = {
            let tx = LockedTransaction::begin(&mut conn)?;
            let entries = match queue {
                Queue::Pending => queries::select_pending(&tx, self.settings.batch_size, now, policy)?,
                Queue::Failed => queries::select_failed(&tx, self.settings.batch_size, now, policy)?,
            };
            tx.commit()?;
            entries
        };

        let mut report = CycleReport {
            selected: candidates.len(),
            ..CycleReport::default()
        };
        if candidates.is_empty() {
            debug!(queue = %queue, "No eligible outbox entries");
            return Ok(report);
        }

        for candidate in candidates {
            let claim = {
                let tx = LockedTransaction::begin(&mut conn)?;
                let claimed = match queries::lock_for_dispatch(
                    &tx,
                    candidate.id(),
                    queue.status(),
                    now,
                    policy,
                )? {
                    Some(entry) => {
                        let token = queries::claim_entry(&tx, entry.id(), self.lease_end(now))?;
                        Some((entry, token))
                    }
                    None => None,
                };
                tx.commit()?;
                claimed
            };
            let Some((mut entry, token)) = claim else {
                debug!(queue = %queue, entry_id = %candidate.id(), "Entry no longer eligible, skipping");
                report.skipped += 1;
                continue;
            };

            let outcome = self.dispatch(&entry);

            let tx = LockedTransaction::begin(&mut conn)?;
            let status = match outcome {
                Ok(()) => {
                    entry.mark_published(now)?;
                    OutboxStatus::Published
                }
                Err(message) => entry.record_failure(
                    message,
                    self.settings.max_retries,
                    self.settings.initial_delay,
                    now,
                )?,
            };
            if !queries::complete_claim(&tx, &entry, &token)? {
                tx.commit()?;
                report.lost_claims += 1;
                warn!(
                    queue = %queue,
                    entry_id = %entry.id(),
                    attempted = %status,
                    "Claim lapsed before dispatch finished, outcome discarded"
                );
                continue;
            }
            tx.commit()?;

            match status {
                OutboxStatus::Published => {
                    report.published += 1;
                    debug!(
                        entry_id = %entry.id(),
                        aggregate_id = %entry.aggregate_id(),
                        version = entry.version(),
                        "Published outbox entry"
                    );
                }
                OutboxStatus::DeadLetter => {
                    report.dead_lettered += 1;
                    error!(
                        entry_id = %entry.id(),
                        aggregate_id = %entry.aggregate_id(),
                        version = entry.version(),
                        retry_count = entry.retry_count(),
                        retryable = entry.is_retryable(),
                        "Outbox entry moved to dead letter"
                    );
                }
                _ => {
                    report.failed += 1;
                    warn!(
                        entry_id = %entry.id(),
                        retry_count = entry.retry_count(),
                        next_retry_at = %entry.next_retry_at(),
                        "Outbox entry scheduled for retry"
                    );
                }
            }
        }

        info!(
            queue = %queue,
            selected = report.selected,
            published = report.published,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            skipped = report.skipped,
            lost_claims = report.lost_claims,
            "Processing cycle complete"
        );
        Ok(report)
    }

    fn lease_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.settings.claim_timeout)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Hand one entry to the publisher. Any failure, including a panic
    /// inside the publisher, comes back as the message to record.
    fn dispatch(&self, entry: &OutboxEntry) -> Result<(), String> {
        let headers = parse_headers(entry);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.publisher
                .publish(entry.topic(), entry.payload(), &headers)
        }));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(
                    entry_id = %entry.id(),
                    topic = %entry.topic(),
                    retryable_hint = err.retryable_hint(),
                    error = %err,
                    "Publish failed"
                );
                Err(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    entry_id = %entry.id(),
                    topic = %entry.topic(),
                    error = %message,
                    "Publisher panicked"
                );
                Err(format!("Unexpected publisher failure: {message}"))
            }
        }
    }

    // ==========================================
    // Metrics
    // ==========================================

    /// Counts by status from one read snapshot.
    pub fn metrics(&self) -> OutboxResult<OutboxMetrics> {
        let mut conn = self.read_conn.lock();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let metrics = OutboxMetrics {
            pending_count: queries::count_pending(&tx)?,
            failed_count: queries::count_failed(&tx)?,
            published_count: queries::count_by_status(&tx, OutboxStatus::Published)?,
            dead_letter_count: queries::count_by_status(&tx, OutboxStatus::DeadLetter)?,
        };
        tx.commit().map_err(DatabaseError::from)?;
        Ok(metrics)
    }

    /// FAILED entries created more than `older_than` ago.
    pub fn stale_failed_count(&self, older_than: Duration) -> OutboxResult<u64> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let conn = self.read_conn.lock();
        Ok(queries::count_failed_older_than(&conn, cutoff)?)
    }
}

/// Malformed stored headers are logged and delivered as an empty map.
fn parse_headers(entry: &OutboxEntry) -> Headers {
    let Some(raw) = entry.headers() else {
        return Headers::new();
    };
    match serde_json::from_str(raw) {
        Ok(headers) => headers,
        Err(err) => {
            warn!(entry_id = %entry.id(), error = %err, "Failed to parse entry headers, sending none");
            Headers::new()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
