//! Non-blocking, batched, drain-safe audit writer.
//!
//! The hot path calls [`AuditSink::log`], which never suspends and never
//! panics: when the sink is closed the event is dropped with a warning, and
//! when the buffer is full the event is dropped and the overflow counter
//! incremented (load shedding — request latency is never spent on audit).
//!
//! A single worker drains the buffer into [`AuditStorage`] in batches of at
//! most [`BATCH_SIZE`], flushing when a batch fills, when the flush tick
//! elapses with a non-empty batch, and once more after the channel closes.
//!
//! # Shutdown
//!
//! [`AuditSink::stop`] is the only way to terminate the worker: set the
//! closed flag, pause briefly so in-flight `log` calls finish, close the
//! channel, then wait for the worker to drain and final-flush. Ambient
//! cancellation deliberately does not reach the worker — once an event was
//! accepted it is persisted before the process exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::event::AuditEvent;
use crate::store::StoreError;

/// Maximum events per storage write.
pub const BATCH_SIZE: usize = 100;

/// Default in-memory buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default flush tick.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for in-flight `log` calls during `stop`.
const CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Destination for persisted audit batches.
#[async_trait::async_trait]
pub trait AuditStorage: Send + Sync {
    /// Persists one batch in a single round trip.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the write fails; the sink logs and carries on.
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StoreError>;
}

/// Hot-path logging seam consumed by the pipeline.
pub trait Auditor: Send + Sync {
    /// Enqueues one event. Must not block.
    fn log(&self, event: AuditEvent);
}

/// Tuning knobs for the sink.
#[derive(Debug, Clone)]
pub struct AuditSinkConfig {
    /// In-memory buffer capacity before load shedding kicks in.
    pub buffer_capacity: usize,
    /// Tick that flushes a partially filled batch.
    pub flush_interval: Duration,
}

impl Default for AuditSinkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// The audit sink. See the module docs for the full contract.
pub struct AuditSink {
    tx: std::sync::RwLock<Option<mpsc::Sender<AuditEvent>>>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<AuditEvent>>>,
    storage: Arc<dyn AuditStorage>,
    flush_interval: Duration,
    closed: AtomicBool,
    overflow: AtomicU64,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AuditSink {
    /// Creates a sink. Events may be enqueued right away; nothing is
    /// persisted until [`AuditSink::start`] runs.
    #[must_use]
    pub fn new(storage: Arc<dyn AuditStorage>, config: AuditSinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        Self {
            tx: std::sync::RwLock::new(Some(tx)),
            rx: std::sync::Mutex::new(Some(rx)),
            storage,
            flush_interval: config.flush_interval,
            closed: AtomicBool::new(false),
            overflow: AtomicU64::new(0),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the drain worker. Idempotent; the second call is a no-op.
    pub fn start(&self) {
        let Some(rx) = self
            .rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let storage = Arc::clone(&self.storage);
        let flush_interval = self.flush_interval;
        let handle = tokio::spawn(worker_loop(rx, storage, flush_interval));

        *self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    /// Drain protocol: close the intake, wait for the worker to flush
    /// everything that was accepted, then return.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);

        // Let in-flight log() calls that already passed the closed check
        // finish their try_send before the channel goes away.
        tokio::time::sleep(CLOSE_GRACE).await;

        info!("stopping audit sink: closing channel and flushing buffer");
        self.tx
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "audit worker terminated abnormally");
            }
        }
        info!("audit sink stopped");
    }

    /// Number of events dropped because the buffer was full.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

impl Auditor for AuditSink {
    fn log(&self, mut event: AuditEvent) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        if self.closed.load(Ordering::SeqCst) {
            warn!(event_id = %event.id, "audit event dropped: sink is stopping");
            return;
        }

        let guard = self
            .tx
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            warn!(event_id = %event.id, "audit event dropped: sink is stopped");
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                error!(
                    agent_id = %event.agent_id,
                    trace_id = %event.trace_id,
                    "audit_buffer_overflow"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event_id = %event.id, "audit event dropped: sink is stopping");
            }
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<AuditEvent>,
    storage: Arc<dyn AuditStorage>,
    flush_interval: Duration,
) {
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= BATCH_SIZE {
                        flush(&storage, &mut batch).await;
                    }
                }
                // recv() yields None only after the channel closed AND the
                // buffer drained, so the final flush below sees everything.
                None => {
                    flush(&storage, &mut batch).await;
                    info!("audit worker finished");
                    return;
                }
            },
            _ = ticker.tick() => flush(&storage, &mut batch).await,
        }
    }
}

async fn flush(storage: &Arc<dyn AuditStorage>, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = storage.write_batch(batch).await {
        error!(error = %e, dropped = batch.len(), "audit flush failed");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingStorage {
        batches: Mutex<Vec<Vec<AuditEvent>>>,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl AuditStorage for RecordingStorage {
        async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.batches.lock().unwrap().push(events.to_vec());
            Ok(())
        }
    }

    fn event(i: usize) -> AuditEvent {
        AuditEvent::begin(&format!("t-{i}"), "a1", "jira.ticket.delete", b"{}")
    }

    #[tokio::test]
    async fn drain_persists_every_accepted_event_in_bounded_batches() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = AuditSink::new(
            Arc::clone(&storage) as Arc<dyn AuditStorage>,
            AuditSinkConfig::default(),
        );
        sink.start();

        for i in 0..250 {
            sink.log(event(i));
        }
        sink.stop().await;

        let batches = storage.batches.lock().unwrap();
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 250);
        assert!(batches.iter().all(|b| b.len() <= BATCH_SIZE));
        assert_eq!(sink.overflow_count(), 0);
    }

    #[tokio::test]
    async fn full_buffer_sheds_load_without_blocking() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = AuditSink::new(
            Arc::clone(&storage) as Arc<dyn AuditStorage>,
            AuditSinkConfig {
                buffer_capacity: 4,
                ..Default::default()
            },
        );
        // Worker intentionally not started: nothing drains.

        for i in 0..10 {
            sink.log(event(i));
        }
        assert_eq!(sink.overflow_count(), 6);
    }

    #[tokio::test]
    async fn log_after_stop_drops_quietly() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = AuditSink::new(
            Arc::clone(&storage) as Arc<dyn AuditStorage>,
            AuditSinkConfig::default(),
        );
        sink.start();
        sink.stop().await;

        sink.log(event(0));
        assert_eq!(sink.overflow_count(), 0);
        assert!(storage.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_failure_does_not_stop_the_worker() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = AuditSink::new(
            Arc::clone(&storage) as Arc<dyn AuditStorage>,
            AuditSinkConfig {
                flush_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        sink.start();

        storage.fail.store(true, Ordering::SeqCst);
        sink.log(event(0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.fail.store(false, Ordering::SeqCst);
        sink.log(event(1));
        sink.stop().await;

        let batches = storage.batches.lock().unwrap();
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn missing_timestamp_is_filled() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = AuditSink::new(
            Arc::clone(&storage) as Arc<dyn AuditStorage>,
            AuditSinkConfig::default(),
        );
        sink.start();

        let mut e = event(0);
        e.timestamp = None;
        sink.log(e);
        sink.stop().await;

        let batches = storage.batches.lock().unwrap();
        assert!(batches[0][0].timestamp.is_some());
    }
}
