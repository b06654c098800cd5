//! Ordered collection of entries awaiting a flush.

use crate::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Pending entries in insertion order.
///
/// `push` is the only way in and `take_all` the only way out; the swap in
/// `take_all` happens under the same lock as `push`, so an entry is never
/// part of two snapshots and never lost between them. Once closed, the
/// buffer refuses new entries under that same lock, so nothing can land
/// behind the final drain.
pub(crate) struct BatchBuffer<P> {
    state: Mutex<Pending<P>>,
    max_batch_size: usize,
    flush_signal: Notify,
}

struct Pending<P> {
    entries: Vec<Entry<P>>,
    closed: bool,
}

impl<P> BatchBuffer<P> {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            state: Mutex::new(Pending {
                entries: Vec::new(),
                closed: false,
            }),
            max_batch_size,
            flush_signal: Notify::new(),
        }
    }

    /// Append an entry. Returns `Ok(true)` when the buffer reached the size
    /// threshold with this insertion, and the entry back if the buffer is
    /// closed.
    pub(crate) fn push(&self, entry: Entry<P>) -> Result<bool, Entry<P>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(entry);
        }
        state.entries.push(entry);
        Ok(state.entries.len() >= self.max_batch_size)
    }

    /// Refuse every later `push`. Entries already buffered stay until the
    /// next `take_all`.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Detach the current contents, leaving the buffer empty.
    pub(crate) fn take_all(&self) -> Vec<Entry<P>> {
        std::mem::take(&mut self.state.lock().entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Ask the flush worker for a size-triggered flush.
    ///
    /// Used by insertions that cannot flush inline (retry timers). The permit
    /// is kept if the worker is busy, so the request is not lost.
    pub(crate) fn request_flush(&self) {
        self.flush_signal.notify_one();
    }

    /// Resolves once a flush has been requested.
    pub(crate) async fn flush_requested(&self) {
        self.flush_signal.notified().await;
    }
}
