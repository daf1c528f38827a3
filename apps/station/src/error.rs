//! Centralized error types for the station binary.

use thiserror::Error;

/// Application-wide error type for the station process.
#[derive(Debug, Error)]
pub enum StationError {
    /// Configuration error detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external decoder subprocess could not be spawned or driven.
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Persisting rotation/DJ state failed.
    #[error("Persistence error: {0}")]
    Persist(String),

    /// A scheduling contract was violated; unrecoverable by design.
    #[error("Contract violation: {0}")]
    Contract(String),
}

/// Convenient Result alias for station-wide operations.
pub type StationResult<T> = Result<T, StationError>;
