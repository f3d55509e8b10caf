//! Error types for gpubid

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for gpubid
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad input or an operation against a day in the wrong status
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No valid session
    #[error("Authentication required")]
    Unauthorized,

    /// Valid session, insufficient rights
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown day, slot, or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Slot or day changed between the caller's read and this write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller cannot cover the incremental commitment
    #[error("Insufficient credits: need {needed}, available {available}")]
    InsufficientCredits {
        needed: Decimal,
        available: Decimal,
    },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpubid operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}
