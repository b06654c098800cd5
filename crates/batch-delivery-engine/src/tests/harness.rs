//! Test harness for engine behavior tests.
//!
//! Provides:
//! - Fixture: an engine wired to a sink and a RecordingAcknowledger
//! - OverlapSink: a slow sink that tracks how many calls overlap
//! - StallingSink: a sink whose first calls never complete
//! - PanickingSink: a sink that panics on one payload and delivers the rest

use crate::testing::{RecordingAcknowledger, RecordingSink, SinkBehavior};
use crate::{AckHandle, BatchConfig, BatchDeliveryEngine, DeliveryResult, Sink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Effectively disables the periodic timer for a test.
pub const NEVER_MS: u64 = 24 * 60 * 60 * 1000;

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn config(max_batch_size: usize, flush_interval_ms: u64) -> BatchConfig {
    BatchConfig {
        max_batch_size,
        flush_interval_ms,
        ..BatchConfig::default()
    }
}

/// A started engine delivering `String` payloads.
pub struct Fixture<S> {
    pub engine: BatchDeliveryEngine<String>,
    pub sink: Arc<S>,
    pub acks: RecordingAcknowledger,
}

impl Fixture<RecordingSink<String>> {
    pub fn recording(config: BatchConfig, behavior: SinkBehavior) -> Self {
        Self::with_sink(config, Arc::new(RecordingSink::new(behavior)))
    }
}

impl<S> Fixture<S>
where
    S: Sink<String> + 'static,
{
    pub fn with_sink(config: BatchConfig, sink: Arc<S>) -> Self {
        let engine = BatchDeliveryEngine::spawn(config, sink.clone()).unwrap();
        Self {
            engine,
            sink,
            acks: RecordingAcknowledger::new(),
        }
    }

    pub fn handle(&self, id: &str) -> AckHandle {
        AckHandle::new(id, self.acks.handle_for(id))
    }

    /// Add a payload whose origin id equals the payload.
    pub async fn add(&self, id: &str) -> DeliveryResult<()> {
        self.engine.add(id.to_string(), self.handle(id)).await
    }
}

/// Sink that takes `latency` per call and records the peak number of
/// overlapping calls.
pub struct OverlapSink {
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delivered: parking_lot::Mutex<Vec<String>>,
}

impl OverlapSink {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delivered: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Sink<String> for OverlapSink {
    async fn send(&self, payload: &String) -> DeliveryResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.delivered.lock().push(payload.clone());
        Ok(())
    }
}

/// Sink whose first `stalls` calls never complete; later calls succeed.
pub struct StallingSink {
    stalls: usize,
    calls: AtomicUsize,
}

impl StallingSink {
    pub fn new(stalls: usize) -> Self {
        Self {
            stalls,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink<String> for StallingSink {
    async fn send(&self, _payload: &String) -> DeliveryResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.stalls {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Sink that panics whenever it is handed `poison` and delivers any other
/// payload.
pub struct PanickingSink {
    poison: String,
    delivered: parking_lot::Mutex<Vec<String>>,
}

impl PanickingSink {
    pub fn new(poison: &str) -> Self {
        Self {
            poison: poison.to_string(),
            delivered: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Sink<String> for PanickingSink {
    async fn send(&self, payload: &String) -> DeliveryResult<()> {
        if *payload == self.poison {
            panic!("sink exploded on {}", payload);
        }
        self.delivered.lock().push(payload.clone());
        Ok(())
    }
}
