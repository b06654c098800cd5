//! Acknowledgement capability tying an entry back to its inbound origin.

use crate::DeliveryResult;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// Transport-side acknowledgement of one inbound message.
///
/// Implementations decide what confirm and reject mean for their transport
/// (stream ACK, broker nack to a dead-letter queue, ...). The engine calls at
/// most one of the two methods, at most once, through [`AckHandle`].
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Mark the origin as permanently and successfully processed.
    async fn confirm(&self) -> DeliveryResult<()>;

    /// Mark the origin as permanently failed and route it to the dead-letter
    /// destination owned by the transport.
    async fn reject(&self) -> DeliveryResult<()>;
}

/// Single-use handle over an [`Acknowledger`].
///
/// `confirm` and `reject` consume the handle. A handle dropped without either
/// call is released: the origin stays unacknowledged and the transport's
/// redelivery policy decides what happens next.
pub struct AckHandle {
    origin: String,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl AckHandle {
    /// Wrap an acknowledger. `origin` labels the inbound message in logs.
    pub fn new(origin: impl Into<String>, acknowledger: impl Acknowledger + 'static) -> Self {
        Self {
            origin: origin.into(),
            acknowledger: Some(Box::new(acknowledger)),
        }
    }

    /// Identifier of the inbound message this handle acknowledges.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Confirm the origin.
    pub async fn confirm(mut self) -> DeliveryResult<()> {
        match self.acknowledger.take() {
            Some(acknowledger) => acknowledger.confirm().await,
            None => Ok(()),
        }
    }

    /// Reject the origin to its dead-letter destination.
    pub async fn reject(mut self) -> DeliveryResult<()> {
        match self.acknowledger.take() {
            Some(acknowledger) => acknowledger.reject().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("origin", &self.origin)
            .field("consumed", &self.acknowledger.is_none())
            .finish()
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if self.acknowledger.is_some() {
            debug!(origin = %self.origin, "Ack handle released without confirm or reject");
        }
    }
}
