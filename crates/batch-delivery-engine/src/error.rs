//! Delivery error types.

use std::time::Duration;
use thiserror::Error;

/// Error type shared by the engine, sinks and acknowledgers.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Sink transport or application failure.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Sink reached the destination but it refused the payload.
    #[error("Sink rejected payload: {status} - {message}")]
    Rejected {
        /// Status code reported by the destination.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The sink panicked while handling one payload.
    #[error("Sink panicked: {0}")]
    SinkPanicked(String),

    /// A sink call exceeded the configured send timeout.
    #[error("Sink call timed out after {0:?}")]
    Timeout(Duration),

    /// Confirming or rejecting an origin failed at the transport.
    #[error("Acknowledgement error: {0}")]
    Ack(String),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start` was called on an engine that is already running.
    #[error("Engine already started")]
    AlreadyStarted,

    /// The engine has been stopped and no longer accepts entries.
    #[error("Engine is stopped")]
    Stopped,

    /// A flush episode ended abnormally (for example a panicking acknowledger).
    #[error("Flush aborted: {0}")]
    FlushAborted(String),
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
