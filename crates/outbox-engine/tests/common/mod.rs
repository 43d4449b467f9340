//! Shared fixtures for outbox integration tests.

#![allow(dead_code)]

use outbox_config::{init_logging, LogFormat};
use outbox_engine::{
    EventPublisher, Headers, OutboxManager, OutboxProcessor, ProcessorSettings, PublishError,
};
use outbox_store::{queries, Database, OrderingPolicy, OutboxEntry};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// One call the publisher accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
    pub headers: Headers,
}

/// Publisher whose behaviour tests can flip at runtime.
#[derive(Default)]
pub struct ScriptedPublisher {
    failing: AtomicBool,
    panicking: AtomicBool,
    fail_payloads: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    deliveries: Mutex<Vec<Delivery>>,
}

impl ScriptedPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    /// Fail every publish of exactly this payload.
    pub fn fail_payload(&self, payload: &str) {
        self.fail_payloads.lock().unwrap().insert(payload.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.deliveries().into_iter().map(|d| d.payload).collect()
    }

    /// Payload -> number of successful deliveries.
    pub fn delivery_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for delivery in self.deliveries() {
            *counts.entry(delivery.payload).or_insert(0) += 1;
        }
        counts
    }
}

impl EventPublisher for ScriptedPublisher {
    fn publish(&self, topic: &str, payload: &str, headers: &Headers) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = if self.panicking.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            panic!("publisher exploded");
        } else if self.failing.load(Ordering::SeqCst)
            || self.fail_payloads.lock().unwrap().contains(payload)
        {
            Err(PublishError::Unavailable("broker offline".into()))
        } else {
            self.deliveries.lock().unwrap().push(Delivery {
                topic: topic.to_string(),
                payload: payload.to_string(),
                headers: headers.clone(),
            });
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn publisher_type(&self) -> &str {
        "scripted"
    }
}

/// A database file, one processor, and a manager over it.
pub struct TestOutbox {
    pub dir: TempDir,
    pub db: Database,
    pub publisher: Arc<ScriptedPublisher>,
    pub processor: Arc<OutboxProcessor>,
    pub manager: OutboxManager,
}

pub fn test_settings() -> ProcessorSettings {
    ProcessorSettings {
        batch_size: 100,
        max_retries: 5,
        initial_delay: Duration::from_secs(1),
        ordering: OrderingPolicy::BlockOnDeadLetter,
        claim_timeout: Duration::from_secs(120),
    }
}

impl TestOutbox {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: ProcessorSettings) -> Self {
        init_logging("debug", LogFormat::Compact);

        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("outbox.db")).unwrap();
        let publisher = ScriptedPublisher::new();
        let processor = Arc::new(OutboxProcessor::new(&db, publisher.clone(), settings).unwrap());
        let manager = OutboxManager::new(processor.clone(), "outbox-events");

        Self {
            dir,
            db,
            publisher,
            processor,
            manager,
        }
    }

    /// Another processor on the same file, as a second worker process would be.
    pub fn second_processor(&self, publisher: Arc<ScriptedPublisher>) -> OutboxProcessor {
        OutboxProcessor::new(&self.db, publisher, *self.processor.settings()).unwrap()
    }

    /// Run `stage` inside one committed transaction.
    pub fn in_tx<T>(&self, stage: impl FnOnce(&rusqlite::Transaction<'_>) -> T) -> T {
        let mut conn = self.db.connect().unwrap();
        let tx = conn.transaction().unwrap();
        let value = stage(&tx);
        tx.commit().unwrap();
        value
    }

    pub fn entry(&self, id: &str) -> OutboxEntry {
        let conn = self.db.connect().unwrap();
        queries::find_entry(&conn, id).unwrap().expect("entry exists")
    }
}
