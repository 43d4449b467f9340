//! Caller-facing outbox API.

use crate::{Headers, OutboxMetrics, OutboxProcessor, OutboxResult, OutgoingMessage};
use outbox_config::OutboxConfig;
use rusqlite::Transaction;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Entry point for application code: stage events and read health.
///
/// ```ignore
/// let tx = conn.transaction()?;
/// save_order(&tx, &order)?;
/// manager
///     .publish_ordered("orders", &order.id, &OrderPlaced::from(&order))
///     .with_header("source", "checkout")
///     .execute(&tx)?;
/// tx.commit()?;
/// ```
pub struct OutboxManager {
    processor: Arc<OutboxProcessor>,
    default_topic: String,
}

impl OutboxManager {
    pub fn new(processor: Arc<OutboxProcessor>, default_topic: impl Into<String>) -> Self {
        Self {
            processor,
            default_topic: default_topic.into(),
        }
    }

    pub fn from_config(processor: Arc<OutboxProcessor>, config: &OutboxConfig) -> Self {
        Self::new(processor, config.publisher.default_topic.clone())
    }

    pub fn processor(&self) -> &Arc<OutboxProcessor> {
        &self.processor
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Start an unordered event (version 0).
    pub fn publish<'a, P>(&'a self, topic: &str, aggregate_id: &str, payload: &'a P) -> EventBuilder<'a, P>
    where
        P: Serialize + ?Sized,
    {
        EventBuilder::new(&self.processor, topic, aggregate_id, payload, false)
    }

    /// Start an event ordered after every earlier ordered event of `aggregate_id`.
    pub fn publish_ordered<'a, P>(
        &'a self,
        topic: &str,
        aggregate_id: &str,
        payload: &'a P,
    ) -> EventBuilder<'a, P>
    where
        P: Serialize + ?Sized,
    {
        EventBuilder::new(&self.processor, topic, aggregate_id, payload, true)
    }

    /// Start an unordered event on the configured default topic.
    pub fn publish_default<'a, P>(&'a self, aggregate_id: &str, payload: &'a P) -> EventBuilder<'a, P>
    where
        P: Serialize + ?Sized,
    {
        EventBuilder::new(&self.processor, &self.default_topic, aggregate_id, payload, false)
    }

    pub fn metrics(&self) -> OutboxResult<OutboxMetrics> {
        self.processor.metrics()
    }

    /// Healthy when nothing is failing or dead-lettered. An unreadable store
    /// counts as unhealthy.
    pub fn is_healthy(&self) -> bool {
        match self.processor.metrics() {
            Ok(metrics) => metrics.is_healthy(),
            Err(err) => {
                warn!(error = %err, "Outbox health check failed");
                false
            }
        }
    }

    /// FAILED entries created more than `older_than` ago.
    pub fn stale_failed_count(&self, older_than: Duration) -> OutboxResult<u64> {
        self.processor.stale_failed_count(older_than)
    }
}

/// Fluent description of one event. Nothing happens until
/// [`execute`](Self::execute).
#[must_use = "an event is only staged by calling execute"]
pub struct EventBuilder<'a, P: ?Sized> {
    processor: &'a OutboxProcessor,
    topic: String,
    aggregate_id: String,
    payload: &'a P,
    headers: Headers,
    retryable: bool,
    ordered: bool,
}

impl<'a, P> EventBuilder<'a, P>
where
    P: Serialize + ?Sized,
{
    fn new(
        processor: &'a OutboxProcessor,
        topic: &str,
        aggregate_id: &str,
        payload: &'a P,
        ordered: bool,
    ) -> Self {
        Self {
            processor,
            topic: topic.to_string(),
            aggregate_id: aggregate_id.to_string(),
            payload,
            headers: Headers::new(),
            retryable: true,
            ordered,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Non-retryable events are dead-lettered on their first failure.
    /// Defaults to `true`.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Validate, serialize, and stage the event in `tx`, returning its id.
    ///
    /// The event is only durable, and only visible to dispatch, once the
    /// caller commits `tx`. On error the caller should roll back.
    ///
    /// A default DEFERRED `tx` works when it has written before, or not
    /// touched the database at all, when `execute` runs. A transaction that
    /// has only read so far cannot take the write lock while another writer
    /// holds it and fails with `SQLITE_BUSY`; open those with
    /// `TransactionBehavior::Immediate`.
    pub fn execute(self, tx: &Transaction<'_>) -> OutboxResult<String> {
        let entry = self.processor.create(
            tx,
            OutgoingMessage {
                topic: &self.topic,
                aggregate_id: &self.aggregate_id,
                payload: self.payload,
                headers: &self.headers,
                retryable: self.retryable,
                ordered: self.ordered,
            },
        )?;
        debug!(entry_id = %entry.id(), ordered = self.ordered, "Event staged via outbox manager");
        Ok(entry.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventPublisher, OutboxError, ProcessorSettings, PublishError};
    use outbox_store::{queries, Database, OutboxStatus};
    use serde::ser::Error as _;
    use tempfile::{tempdir, TempDir};

    struct NoopPublisher;

    impl EventPublisher for NoopPublisher {
        fn publish(&self, _: &str, _: &str, _: &Headers) -> Result<(), PublishError> {
            Ok(())
        }

        fn publisher_type(&self) -> &str {
            "noop"
        }
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to serialize"))
        }
    }

    fn setup() -> (TempDir, Database, OutboxManager) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("outbox.db")).unwrap();
        let processor = Arc::new(
            OutboxProcessor::new(&db, Arc::new(NoopPublisher), ProcessorSettings::default())
                .unwrap(),
        );
        let manager = OutboxManager::from_config(processor, &OutboxConfig::default());
        (dir, db, manager)
    }

    #[test]
    fn test_builder_stages_entry_with_headers() {
        let (_dir, db, manager) = setup();
        let mut conn = db.connect().unwrap();

        let tx = conn.transaction().unwrap();
        let id = manager
            .publish("orders", "order-1", &serde_json::json!({ "total": 5 }))
            .with_header("source", "checkout")
            .with_headers([("trace", "t-1"), ("source", "override")])
            .retryable(false)
            .execute(&tx)
            .unwrap();
        tx.commit().unwrap();

        let entry = queries::find_entry(&conn, &id).unwrap().unwrap();
        assert_eq!(entry.topic(), "orders");
        assert_eq!(entry.version(), 0);
        assert!(!entry.is_retryable());
        assert_eq!(entry.status(), OutboxStatus::Pending);
        assert_eq!(entry.headers(), Some(r#"{"source":"override","trace":"t-1"}"#));
    }

    #[test]
    fn test_publish_ordered_and_default_topic() {
        let (_dir, db, manager) = setup();
        let mut conn = db.connect().unwrap();

        let tx = conn.transaction().unwrap();
        let first = manager.publish_ordered("orders", "agg", "a").execute(&tx).unwrap();
        let second = manager.publish_ordered("orders", "agg", "b").execute(&tx).unwrap();
        let default = manager.publish_default("agg", &42).execute(&tx).unwrap();
        tx.commit().unwrap();

        let version = |id: &str| queries::find_entry(&conn, id).unwrap().unwrap().version();
        assert_eq!(version(&first), 1);
        assert_eq!(version(&second), 2);
        assert_eq!(version(&default), 0);

        let entry = queries::find_entry(&conn, &default).unwrap().unwrap();
        assert_eq!(entry.topic(), "outbox-events");
        assert_eq!(entry.payload(), "42");
    }

    #[test]
    fn test_serialization_failure_persists_nothing() {
        let (_dir, db, manager) = setup();
        let mut conn = db.connect().unwrap();

        let tx = conn.transaction().unwrap();
        let err = manager
            .publish("orders", "agg", &Unserializable)
            .execute(&tx)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Serialization(_)));
        assert!(err.to_string().starts_with("Failed to serialize event payload"));
        tx.rollback().unwrap();

        assert_eq!(manager.metrics().unwrap().total_count(), 0);
    }

    #[test]
    fn test_validation_failure() {
        let (_dir, db, manager) = setup();
        let mut conn = db.connect().unwrap();
        let tx = conn.transaction().unwrap();

        let err = manager.publish("", "agg", "x").execute(&tx).unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
    }

    #[test]
    fn test_health_reflects_metrics() {
        let (_dir, db, manager) = setup();
        assert!(manager.is_healthy());

        let mut conn = db.connect().unwrap();
        let tx = conn.transaction().unwrap();
        manager.publish("t", "a", "x").retryable(false).execute(&tx).unwrap();
        tx.commit().unwrap();
        assert!(manager.is_healthy());
        assert_eq!(manager.metrics().unwrap().pending_count, 1);

        // Make the store unreadable.
        conn.execute_batch("DROP TABLE outbox").unwrap();
        assert!(!manager.is_healthy());
    }
}
