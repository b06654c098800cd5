//! Batch delivery engine: buffered, at-least-once delivery of payloads to a
//! downstream sink.
//!
//! Inbound messages are buffered together with a single-use acknowledgement
//! handle for their origin. The buffer is flushed when it reaches a size
//! threshold or when a periodic timer fires. Each entry is delivered on its
//! own; successes confirm the origin, failures are retried with exponential
//! backoff, and entries that exhaust their retries are rejected so the
//! transport can dead-letter them.
//!
//! # Core Invariants
//!
//! 1. **At-Least-Once**: an origin is confirmed only after its payload was
//!    accepted by the sink
//! 2. **Single Acknowledgement**: every origin is confirmed or rejected at
//!    most once
//! 3. **Bounded Retry**: an entry is attempted at most `max_retries + 1` times
//! 4. **Snapshot Flushing**: a flush delivers exactly what was buffered when
//!    it started; later arrivals wait for the next flush
//! 5. **Serialized Delivery**: at most one sink call is in flight
//!
//! # Architecture
//!
//! ```text
//! producer --add--> BatchBuffer --size / interval--> flush --> Sink
//!                       ^                                       |
//!                       |                      ok: confirm      |
//!                       |__ RetryScheduler <-- err, budget left |
//!                                              err, exhausted: reject
//! ```

pub mod ack;
pub mod backoff;
mod buffer;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
mod retry;
mod shutdown;
pub mod sink;
pub mod testing;
pub mod trigger;

#[cfg(test)]
mod tests;

pub use ack::{AckHandle, Acknowledger};
pub use backoff::backoff_delay;
pub use config::BatchConfig;
pub use engine::{BatchDeliveryEngine, EngineStats, FlushReport};
pub use entry::{DeliveryOutcome, Entry};
pub use error::{DeliveryError, DeliveryResult};
pub use sink::Sink;
pub use trigger::FlushTrigger;
