//! The batch delivery engine.

use crate::backoff::backoff_delay;
use crate::buffer::BatchBuffer;
use crate::retry::RetryScheduler;
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::trigger::spawn_flush_worker;
use crate::{
    AckHandle, BatchConfig, DeliveryError, DeliveryOutcome, DeliveryResult, Entry, FlushTrigger,
    Sink,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Summary of one flush episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// What started the episode.
    pub trigger: FlushTrigger,
    /// Entries delivered and confirmed.
    pub confirmed: usize,
    /// Entries that failed and were handed to the retry scheduler.
    pub retries_scheduled: usize,
    /// Entries that exhausted their retries and were rejected.
    pub dead_lettered: usize,
    /// Entries that failed during shutdown and were left unacknowledged.
    pub released: usize,
}

impl FlushReport {
    fn new(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Confirmed => self.confirmed += 1,
            DeliveryOutcome::RetryScheduled { .. } => self.retries_scheduled += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
            DeliveryOutcome::Released => self.released += 1,
        }
    }

    /// Number of entries the episode processed.
    pub fn processed(&self) -> usize {
        self.confirmed + self.retries_scheduled + self.dead_lettered + self.released
    }
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Entries waiting in the buffer.
    pub buffered: usize,
    /// Retry timers armed and not yet expired.
    pub pending_retries: usize,
    /// Origins confirmed since start.
    pub confirmed: u64,
    /// Retries scheduled since start.
    pub retries_scheduled: u64,
    /// Origins rejected to dead-letter since start.
    pub dead_lettered: u64,
    /// Failed entries released during shutdown.
    pub released: u64,
    /// Non-empty flush episodes started by the size threshold.
    pub size_flushes: u64,
    /// Non-empty flush episodes started by the periodic timer.
    pub interval_flushes: u64,
}

#[derive(Default)]
struct DeliveryCounters {
    confirmed: AtomicU64,
    retries_scheduled: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
    size_flushes: AtomicU64,
    interval_flushes: AtomicU64,
}

impl DeliveryCounters {
    fn record_outcome(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Confirmed => &self.confirmed,
            DeliveryOutcome::RetryScheduled { .. } => &self.retries_scheduled,
            DeliveryOutcome::DeadLettered => &self.dead_lettered,
            DeliveryOutcome::Released => &self.released,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_episode(&self, trigger: FlushTrigger) {
        match trigger {
            FlushTrigger::Size => {
                self.size_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushTrigger::Interval => {
                self.interval_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushTrigger::Manual | FlushTrigger::Shutdown => {}
        }
    }
}

/// State shared between the engine handle, the flush worker and flush tasks.
pub(crate) struct EngineInner<P> {
    config: BatchConfig,
    sink: Arc<dyn Sink<P>>,
    buffer: Arc<BatchBuffer<P>>,
    /// Serializes flush episodes: at most one sink call in flight.
    flush_guard: tokio::sync::Mutex<()>,
    retries: RetryScheduler,
    shutdown: ShutdownTrigger,
    counters: DeliveryCounters,
    /// Set once the flush worker is running.
    started: AtomicBool,
}

impl<P> EngineInner<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub(crate) fn buffer(&self) -> &BatchBuffer<P> {
        &self.buffer
    }

    pub(crate) fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// Run one flush episode: detach the buffer and deliver each entry in
    /// insertion order.
    pub(crate) async fn flush(self: &Arc<Self>, trigger: FlushTrigger) -> FlushReport {
        let _episode = self.flush_guard.lock().await;

        let snapshot = self.buffer.take_all();
        let mut report = FlushReport::new(trigger);
        if snapshot.is_empty() {
            return report;
        }

        self.counters.record_episode(trigger);
        debug!(trigger = %trigger, entries = snapshot.len(), "Flushing batch");

        for entry in snapshot {
            let outcome = self.deliver(entry).await;
            self.counters.record_outcome(outcome);
            report.record(outcome);
        }

        debug!(
            trigger = %trigger,
            confirmed = report.confirmed,
            retries_scheduled = report.retries_scheduled,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "Flush complete"
        );
        report
    }

    /// Run a flush episode on its own task and wait for it. A caller that
    /// drops the returned future cannot strand entries already detached, and
    /// a panic outside the sink call surfaces as
    /// [`DeliveryError::FlushAborted`].
    pub(crate) async fn spawn_flush(
        self: &Arc<Self>,
        trigger: FlushTrigger,
    ) -> DeliveryResult<FlushReport> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.flush(trigger).await })
            .await
            .map_err(|err| {
                error!(trigger = %trigger, error = %err, "Flush episode aborted");
                DeliveryError::FlushAborted(err.to_string())
            })
    }

    /// A retry re-insertion filled the buffer. The worker flushes when it is
    /// running; otherwise the flush runs on a task of its own.
    fn retry_filled_buffer(self: &Arc<Self>) {
        if self.started.load(Ordering::SeqCst) {
            self.buffer.request_flush();
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _ = inner.spawn_flush(FlushTrigger::Size).await;
        });
    }

    /// Attempt one entry and route it to its next state.
    async fn deliver(self: &Arc<Self>, entry: Entry<P>) -> DeliveryOutcome {
        if entry.retry_count() > 0 {
            info!(
                origin = %entry.origin(),
                retry_count = entry.retry_count(),
                max_retries = self.config.max_retries,
                "Retrying delivery"
            );
        }

        let err = match self.send(&entry).await {
            Ok(()) => {
                info!(origin = %entry.origin(), attempt = entry.attempt(), "Entry delivered");
                let ack = entry.into_ack();
                let origin = ack.origin().to_string();
                if let Err(err) = ack.confirm().await {
                    error!(origin = %origin, error = %err, "Failed to confirm origin");
                }
                return DeliveryOutcome::Confirmed;
            }
            Err(err) => err,
        };

        if entry.retry_count() >= self.config.max_retries {
            error!(
                origin = %entry.origin(),
                attempts = entry.attempt(),
                error = %err,
                "Max retries reached, dead-lettering entry"
            );
            let ack = entry.into_ack();
            let origin = ack.origin().to_string();
            if let Err(err) = ack.reject().await {
                error!(origin = %origin, error = %err, "Failed to reject origin");
            }
            return DeliveryOutcome::DeadLettered;
        }

        if self.shutdown.is_triggered() {
            warn!(
                origin = %entry.origin(),
                attempt = entry.attempt(),
                error = %err,
                "Delivery failed during shutdown, releasing entry unacknowledged"
            );
            return DeliveryOutcome::Released;
        }

        let delay = backoff_delay(self.config.base_delay(), entry.retry_count());
        warn!(
            origin = %entry.origin(),
            attempt = entry.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Delivery failed, scheduling retry"
        );
        let engine: Weak<Self> = Arc::downgrade(self);
        self.retries
            .schedule(entry, delay, self.buffer.clone(), move || {
                if let Some(inner) = engine.upgrade() {
                    inner.retry_filled_buffer();
                }
            });
        DeliveryOutcome::RetryScheduled { delay }
    }

    /// One sink call, bounded by the configured send timeout. A panic in
    /// the sink fails this call only.
    async fn send(&self, entry: &Entry<P>) -> DeliveryResult<()> {
        let send = async {
            match AssertUnwindSafe(self.sink.send(entry.payload()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(DeliveryError::SinkPanicked(panic_message(panic.as_ref()))),
            }
        };
        match self.config.send_timeout() {
            Some(limit) => match timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(limit)),
            },
            None => send.await,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Buffered, at-least-once delivery engine.
///
/// Producers hand payloads with their [`AckHandle`] to [`add`](Self::add).
/// Entries are flushed when the buffer reaches `max_batch_size` or when the
/// periodic timer fires, delivered one by one to the [`Sink`], and then
/// confirmed, retried with exponential backoff, or rejected to dead-letter
/// once `max_retries` retries have failed.
///
/// # Lifecycle
///
/// 1. Create with [`BatchDeliveryEngine::new()`]
/// 2. Call [`start()`](Self::start) to run the periodic flush timer
///    (or use [`spawn()`](Self::spawn) for both)
/// 3. Publish entries with [`add()`](Self::add)
/// 4. Call [`stop()`](Self::stop) to cancel retry timers and drain the buffer
///
/// # Concurrency
///
/// Flush episodes are serialized. A trigger that fires while an episode is
/// in flight waits for it and then flushes whatever accumulated meanwhile.
pub struct BatchDeliveryEngine<P> {
    inner: Arc<EngineInner<P>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P> BatchDeliveryEngine<P>
where
    P: Send + Sync + 'static,
{
    /// Create an engine. The periodic timer does not run until
    /// [`start()`](Self::start); size-triggered flushes, including those
    /// caused by retried entries, work either way.
    pub fn new(config: BatchConfig, sink: Arc<dyn Sink<P>>) -> DeliveryResult<Self> {
        config.validate()?;

        let shutdown = ShutdownTrigger::new();
        let retries = RetryScheduler::new(shutdown.subscribe());
        let inner = EngineInner {
            buffer: Arc::new(BatchBuffer::new(config.max_batch_size)),
            config,
            sink,
            flush_guard: tokio::sync::Mutex::new(()),
            retries,
            shutdown,
            counters: DeliveryCounters::default(),
            started: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        })
    }

    /// Create and start an engine. Must be called within a Tokio runtime.
    pub fn spawn(config: BatchConfig, sink: Arc<dyn Sink<P>>) -> DeliveryResult<Self> {
        let engine = Self::new(config, sink)?;
        engine.start()?;
        Ok(engine)
    }

    /// Start the periodic flush timer. Must be called within a Tokio runtime.
    pub fn start(&self) -> DeliveryResult<()> {
        if self.inner.shutdown.is_triggered() {
            return Err(DeliveryError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::AlreadyStarted);
        }

        let handle = spawn_flush_worker(self.inner.clone());
        *self.worker.lock() = Some(handle);

        info!(
            max_batch_size = self.inner.config.max_batch_size,
            flush_interval_ms = self.inner.config.flush_interval_ms,
            max_retries = self.inner.config.max_retries,
            base_delay_ms = self.inner.config.base_delay_ms,
            "Batch delivery engine started"
        );
        Ok(())
    }

    /// Buffer a payload for delivery.
    ///
    /// Returns once the entry is buffered or, if it filled the buffer, once
    /// the flush it triggered has finished. Delivery failures are never
    /// returned here; they end in a retry or a dead-letter rejection.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Stopped`] if the engine has been stopped; the
    ///   handle is released unacknowledged.
    /// - [`DeliveryError::FlushAborted`] if the triggered flush episode
    ///   terminated abnormally.
    pub async fn add(&self, payload: P, ack: AckHandle) -> DeliveryResult<()> {
        match self.inner.buffer.push(Entry::new(payload, ack)) {
            Ok(true) => {
                self.run_flush(FlushTrigger::Size).await?;
            }
            Ok(false) => {}
            Err(refused) => {
                warn!(origin = %refused.origin(), "Engine stopped, refusing entry");
                return Err(DeliveryError::Stopped);
            }
        }
        Ok(())
    }

    /// Flush the buffer now, independent of the size and interval triggers.
    pub async fn flush(&self) -> DeliveryResult<FlushReport> {
        self.run_flush(FlushTrigger::Manual).await
    }

    /// Stop the engine.
    ///
    /// Stops the periodic timer, cancels armed retry timers (their origins
    /// are released unacknowledged), then drains the buffer with one final
    /// flush. Failed entries in that flush are dead-lettered if their retry
    /// budget is spent and released otherwise. Later calls to `add` fail
    /// with [`DeliveryError::Stopped`]. Calling `stop` again is a no-op.
    pub async fn stop(&self) -> DeliveryResult<FlushReport> {
        if !self.inner.shutdown.trigger() {
            return Ok(FlushReport::new(FlushTrigger::Shutdown));
        }
        self.inner.buffer.close();
        info!(
            buffered = self.inner.buffer.len(),
            pending_retries = self.inner.retries.armed(),
            "Stopping batch delivery engine"
        );

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "Flush worker ended abnormally");
            }
        }
        self.inner.retries.drain().await;

        let report = self.run_flush(FlushTrigger::Shutdown).await?;
        info!(
            confirmed = report.confirmed,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "Batch delivery engine stopped"
        );
        Ok(report)
    }

    /// Current counters and queue depths.
    pub fn stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        EngineStats {
            buffered: self.inner.buffer.len(),
            pending_retries: self.inner.retries.armed(),
            confirmed: counters.confirmed.load(Ordering::Relaxed),
            retries_scheduled: counters.retries_scheduled.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            size_flushes: counters.size_flushes.load(Ordering::Relaxed),
            interval_flushes: counters.interval_flushes.load(Ordering::Relaxed),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Whether [`stop()`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    async fn run_flush(&self, trigger: FlushTrigger) -> DeliveryResult<FlushReport> {
        self.inner.spawn_flush(trigger).await
    }
}

impl<P> Drop for BatchDeliveryEngine<P> {
    fn drop(&mut self) {
        if self.inner.shutdown.trigger() {
            self.inner.buffer.close();
            debug!("Batch delivery engine dropped without stop, cancelling timers");
        }
    }
}
