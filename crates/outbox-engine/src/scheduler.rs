//! Periodic drivers for the pending and retry cycles.
//!
//! Two independent interval loops, one per queue. A tick that finds its
//! queue's previous cycle still running is skipped rather than queued, and
//! cycles run on the blocking pool so a slow publisher never stalls the
//! timers.

use crate::{OutboxProcessor, Queue};
use outbox_config::OutboxConfig;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// When false, [`OutboxScheduler::start`] spawns nothing.
    pub enabled: bool,
    pub publish_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            enabled: config.processing.enabled,
            publish_interval: config.processing.publish_interval(),
            retry_interval: config.processing.retry_interval(),
        }
    }
}

/// Result of a single tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A cycle was started on the blocking pool.
    Started(JoinHandle<()>),
    /// The previous cycle for this queue still holds the guard.
    Skipped,
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Drives an [`OutboxProcessor`] on two timers.
#[derive(Clone)]
pub struct OutboxScheduler {
    processor: Arc<OutboxProcessor>,
    settings: SchedulerSettings,
    pending_guard: Arc<Semaphore>,
    failed_guard: Arc<Semaphore>,
}

impl OutboxScheduler {
    pub fn new(processor: Arc<OutboxProcessor>, settings: SchedulerSettings) -> Self {
        Self {
            processor,
            settings,
            pending_guard: Arc::new(Semaphore::new(1)),
            failed_guard: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Spawn the publish and retry loops. Must be called inside a Tokio runtime.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if !self.settings.enabled {
            info!("Outbox processing disabled, scheduler not started");
            return SchedulerHandle {
                shutdown: shutdown_tx,
                tasks: Vec::new(),
            };
        }

        let publisher = self.processor.publisher();
        info!(
            publisher_type = publisher.publisher_type(),
            publisher_healthy = publisher.is_healthy(),
            publish_interval_ms = u64::try_from(self.settings.publish_interval.as_millis()).unwrap_or(u64::MAX),
            retry_interval_ms = u64::try_from(self.settings.retry_interval.as_millis()).unwrap_or(u64::MAX),
            "Starting outbox scheduler"
        );

        let tasks = vec![
            self.spawn_loop(Queue::Pending, self.settings.publish_interval, shutdown_rx.clone()),
            self.spawn_loop(Queue::Failed, self.settings.retry_interval, shutdown_rx),
        ];

        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    fn spawn_loop(
        &self,
        queue: Queue,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick(queue);
                    }
                    _ = shutdown.changed() => break,
                }
            }

            debug!(queue = %queue, "Outbox scheduler loop stopped");
        })
    }

    /// Start one cycle for `queue` unless the previous one is still running.
    ///
    /// The cycle's errors and panics are logged and swallowed; the next tick
    /// proceeds normally. Must be called inside a Tokio runtime.
    pub fn tick(&self, queue: Queue) -> TickOutcome {
        let guard = match queue {
            Queue::Pending => &self.pending_guard,
            Queue::Failed => &self.failed_guard,
        };

        let permit = match guard.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(queue = %queue, "Skipping outbox cycle, previous cycle still in progress");
                return TickOutcome::Skipped;
            }
        };

        let processor = self.processor.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match panic::catch_unwind(AssertUnwindSafe(|| processor.process(queue))) {
                Ok(Ok(report)) => {
                    debug!(
                        queue = %queue,
                        selected = report.selected,
                        published = report.published,
                        "Outbox cycle finished"
                    );
                }
                Ok(Err(err)) => {
                    error!(queue = %queue, error = %err, "Outbox processing cycle failed");
                }
                Err(_) => {
                    error!(queue = %queue, "Outbox processing cycle panicked");
                }
            }
        });

        TickOutcome::Started(handle)
    }

    #[cfg(test)]
    fn guard(&self, queue: Queue) -> Arc<Semaphore> {
        match queue {
            Queue::Pending => self.pending_guard.clone(),
            Queue::Failed => self.failed_guard.clone(),
        }
    }
}

/// Running scheduler loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Whether any loop was spawned.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop both loops and wait for them to exit. A cycle already on the
    /// blocking pool runs to completion on its own.
    pub async fn shutdown(self) {
        // Only fails when no loop was spawned, so there is nothing to signal.
        if self.shutdown.send(true).is_err() {
            debug!("No outbox scheduler loops to signal");
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Outbox scheduler loop ended abnormally");
            }
        }
        info!("Outbox scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventPublisher, Headers, ProcessorSettings, PublishError};
    use outbox_store::Database;
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

    fn scheduler(enabled: bool) -> (TempDir, OutboxScheduler) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("outbox.db")).unwrap();
        let processor = Arc::new(
            OutboxProcessor::new(&db, Arc::new(NoopPublisher), ProcessorSettings::default())
                .unwrap(),
        );
        let settings = SchedulerSettings {
            enabled,
            publish_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
        };
        (dir, OutboxScheduler::new(processor, settings))
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = OutboxConfig::default();
        config.processing.enabled = false;
        config.processing.publish_interval_ms = 500;

        let settings = SchedulerSettings::from_config(&config);
        assert!(!settings.enabled);
        assert_eq!(settings.publish_interval, Duration::from_millis(500));
        assert_eq!(settings.retry_interval, Duration::from_secs(30));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tick_skips_while_guard_held() {
        let (_dir, scheduler) = scheduler(true);

        let held = scheduler.guard(Queue::Pending).try_acquire_owned().unwrap();
        assert!(scheduler.tick(Queue::Pending).is_skipped());

        // The other queue has its own guard.
        match scheduler.tick(Queue::Failed) {
            TickOutcome::Started(handle) => handle.await.unwrap(),
            TickOutcome::Skipped => panic!("failed queue should not be blocked"),
        }

        drop(held);
        match scheduler.tick(Queue::Pending) {
            TickOutcome::Started(handle) => handle.await.unwrap(),
            TickOutcome::Skipped => panic!("guard was released"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disabled_scheduler_spawns_nothing() {
        let (_dir, scheduler) = scheduler(false);
        let handle = scheduler.start();
        assert!(!handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_shutdown() {
        let (_dir, scheduler) = scheduler(true);
        let handle = scheduler.start();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("scheduler did not stop");
    }
}
