//! Error types for the CRM relay.

use batch_delivery_engine::DeliveryError;
use thiserror::Error;

/// CRM relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Delivery engine error
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Result type for CRM relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
