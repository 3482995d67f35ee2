//! Error types for the query cache.
//!
//! [`Error`] covers failures of the cache machinery itself (registry and
//! configuration). Failures of user supplied query or mutation functions keep
//! their own error type `E`; [`QueryError`] is a ready-made choice for it.

use thiserror::Error;

/// Errors raised by the registry and by configuration validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A key was registered with one value/error type and requested with another.
    #[error("cache key {key:?} is registered with a different value or error type")]
    KeyTypeMismatch { key: String },

    /// A retry configuration was rejected at setup time.
    #[error("invalid retry configuration for {action:?}: {reason}")]
    InvalidRetryConfig { action: String, reason: String },
}

/// Result alias for registry and configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for query and mutation functions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}
