//! The unit of buffered work and the outcome of delivering it.

use crate::AckHandle;
use std::fmt;
use std::time::Duration;

/// One buffered item: payload, retry count and the handle of its origin.
///
/// Entries are immutable. A retry produces a new entry that carries the same
/// payload and ack handle with `retry_count + 1`, so the number of sink
/// attempts already made for an origin is always `retry_count`.
pub struct Entry<P> {
    payload: P,
    retry_count: u32,
    ack: AckHandle,
}

impl<P> Entry<P> {
    pub(crate) fn new(payload: P, ack: AckHandle) -> Self {
        Self {
            payload,
            retry_count: 0,
            ack,
        }
    }

    /// The opaque payload handed to the sink.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Retries already scheduled for this origin.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Attempt number of the next sink call (1-based).
    pub fn attempt(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Label of the inbound message this entry came from.
    pub fn origin(&self) -> &str {
        self.ack.origin()
    }

    /// The entry to re-insert after a failed attempt.
    pub(crate) fn into_retry(self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self
        }
    }

    /// Ends the entry's lifecycle, yielding the handle for its terminal call.
    pub(crate) fn into_ack(self) -> AckHandle {
        self.ack
    }
}

impl<P> fmt::Debug for Entry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("origin", &self.origin())
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// What a single delivery attempt did with its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sink accepted the payload; the origin was confirmed.
    Confirmed,
    /// Sink failed; the entry re-enters the buffer after `delay`.
    RetryScheduled {
        /// Backoff before re-insertion.
        delay: Duration,
    },
    /// Sink failed with the retry budget spent; the origin was rejected.
    DeadLettered,
    /// Sink failed while the engine was shutting down; the origin was left
    /// unacknowledged.
    Released,
}
