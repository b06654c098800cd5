//! CRM relay: moves CRM events from a Redis stream to the CRM HTTP API.
//!
//! Messages are read with XREADGROUP, decoded as JSON and handed to a
//! [`BatchDeliveryEngine`](batch_delivery_engine::BatchDeliveryEngine) that
//! posts them to the CRM API. A message is XACKed only after the API
//! accepted it. Messages that cannot be decoded, or that exhaust their
//! retries, are copied to a dead-letter stream and then XACKed.
//!
//! A message that is never acknowledged (released at shutdown, or lost to a
//! crashed process) stays in the group's pending list. Every relay sweeps
//! that list with XAUTOCLAIM at startup and every `claim_interval`, taking
//! over messages idle for longer than `claim_min_idle`, whichever consumer
//! they were delivered to.
//!
//! # Architecture
//!
//! ```text
//! Redis Stream --XREADGROUP--> Relay --add--> Engine --POST--> CRM API
//!     ^                                          |
//!     |_____ XACK / XADD dead-letter + XACK <____|
//! ```

pub mod config;
pub mod error;
pub mod http_sink;
pub mod redis_consumer;
pub mod relay;

#[cfg(test)]
mod tests;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use http_sink::CrmApiSink;
pub use redis_consumer::{
    ClaimedMessages, GroupReader, RedisConsumer, RedisStreams, StreamAcknowledger, StreamMessage,
    StreamOps,
};
pub use relay::{dispatch, DeadLetterReason, Dispatched, Relay};
