//! Error types for counter operations

use crate::counter::CounterStoreError;
use thiserror::Error;

/// Errors surfaced by the recorder, reconciler and history reader.
#[derive(Debug, Error)]
pub enum CounterError {
    /// Malformed input; nothing was changed
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or wrong request signature; nothing was changed
    #[error("invalid signature")]
    Unauthorized,

    /// Volatile store unreachable or refused the batch; nothing was changed
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Durable store failure
    #[error("durable store failed: {0}")]
    Durable(String),
}

impl From<CounterStoreError> for CounterError {
    fn from(e: CounterStoreError) -> Self {
        CounterError::StoreUnavailable(e.to_string())
    }
}

impl From<anyhow::Error> for CounterError {
    fn from(e: anyhow::Error) -> Self {
        CounterError::Durable(format!("{:#}", e))
    }
}

impl From<sqlx::Error> for CounterError {
    fn from(e: sqlx::Error) -> Self {
        CounterError::Durable(e.to_string())
    }
}
