//! One-shot retry timers that re-insert failed entries.

use crate::buffer::BatchBuffer;
use crate::shutdown::ShutdownSignal;
use crate::Entry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::debug;

/// Owns every armed retry timer of one engine.
///
/// Each timer re-inserts exactly one entry when it expires. All timers
/// observe the engine's shutdown signal; a timer cancelled by shutdown drops
/// its entry, which releases the origin unacknowledged.
pub(crate) struct RetryScheduler {
    tasks: Mutex<JoinSet<()>>,
    armed: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
}

impl RetryScheduler {
    pub(crate) fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            armed: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Arm a timer that re-inserts `entry` (with its retry count incremented)
    /// into `buffer` after `delay`.
    ///
    /// `on_threshold` runs if the insertion reaches the size threshold; the
    /// timer task itself never flushes.
    pub(crate) fn schedule<P, F>(
        &self,
        entry: Entry<P>,
        delay: Duration,
        buffer: Arc<BatchBuffer<P>>,
        on_threshold: F,
    ) where
        P: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let mut shutdown = self.shutdown.clone();
        let armed = self.armed.clone();
        let timer = sleep(delay);
        armed.fetch_add(1, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    debug!(
                        origin = %entry.origin(),
                        retry_count = entry.retry_count(),
                        "Retry timer cancelled by shutdown"
                    );
                    drop(entry);
                }
                _ = timer => {
                    let next = entry.into_retry();
                    debug!(
                        origin = %next.origin(),
                        retry_count = next.retry_count(),
                        "Retry timer expired, re-inserting entry"
                    );
                    match buffer.push(next) {
                        Ok(true) => on_threshold(),
                        Ok(false) => {}
                        Err(refused) => {
                            debug!(
                                origin = %refused.origin(),
                                "Engine stopped, releasing retried entry"
                            );
                        }
                    }
                }
            }
            armed.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Timers armed and not yet expired or cancelled.
    pub(crate) fn armed(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }

    /// Wait for every timer task to finish. Call after the shutdown signal
    /// has been sent, otherwise this waits for the full backoff delays.
    pub(crate) async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
    }
}
