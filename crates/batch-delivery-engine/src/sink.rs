//! Delivery target contract.

use crate::DeliveryResult;
use async_trait::async_trait;

/// Downstream destination for a single payload.
///
/// A sink performs exactly one attempt per call and reports any non-success
/// as an error. Retry, backoff and dead-lettering are the engine's job.
#[async_trait]
pub trait Sink<P>: Send + Sync {
    /// Attempt to deliver one payload.
    async fn send(&self, payload: &P) -> DeliveryResult<()>;
}
