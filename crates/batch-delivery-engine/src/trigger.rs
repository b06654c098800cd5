//! Flush triggers and the background flush worker.

use crate::engine::EngineInner;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// What started a flush episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushTrigger {
    /// The buffer reached `max_batch_size`.
    Size,
    /// The periodic flush timer fired.
    Interval,
    /// A caller invoked `flush` directly.
    #[default]
    Manual,
    /// The final drain during `stop`.
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Spawn the worker that owns the periodic timer.
///
/// The worker flushes on every tick (first tick one full period after
/// start) and whenever a retry re-insertion fills the buffer. It exits when
/// the engine's shutdown signal fires; an episode already running is
/// finished first.
pub(crate) fn spawn_flush_worker<P>(inner: Arc<EngineInner<P>>) -> JoinHandle<()>
where
    P: Send + Sync + 'static,
{
    let period = inner.config().flush_interval();
    let mut shutdown = inner.shutdown_signal();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    break;
                }
                _ = inner.buffer().flush_requested() => {
                    let _ = inner.spawn_flush(FlushTrigger::Size).await;
                }
                _ = ticker.tick() => {
                    let _ = inner.spawn_flush(FlushTrigger::Interval).await;
                }
            }
        }

        debug!("Flush worker stopped");
    })
}
