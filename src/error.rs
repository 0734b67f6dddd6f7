//! Error types for Tollgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The algorithm tag is not one of the known algorithms.
    #[error("algorithm is not supported: {0}")]
    UnsupportedAlgorithm(String),

    /// The limit violates its invariants (e.g. a zero period).
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// The shared store failed while running an atomic procedure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The procedure's result tuple did not have the expected shape.
    ///
    /// A correct procedure never produces this; callers should alert on it
    /// rather than treat it as either allowed or denied.
    #[error("malformed procedure result: {0}")]
    Decode(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
