//! Error types used across the broker.
//!
//! The split mirrors how failures are treated: `StoreError` covers the
//! persistence layer (precondition violations and backend failures), while
//! `BrokerError` is what crosses the dispatcher boundary, where it is logged
//! with the packet kind and surfaced as a connection-level error signal.

use thiserror::Error;

/// Persistence-layer failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Every persisted message must be attributable to its publisher.
    #[error("stored message is missing a client identifier")]
    MissingClientId,

    #[error("storage backend failure: {0}")]
    Backend(#[from] sled::Error),

    #[error("record serialization failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A record read back from the store did not decode.
    #[error("corrupt stored record for key {key}")]
    Corrupt { key: String },
}

/// Failure raised by a protocol engine handler.
///
/// Protocol anomalies (unknown message ids, packets from unbound
/// connections) are logged and swallowed inside the engine; only failures
/// the transport may want to act on are represented here.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
