//! Unified error types for attrstore.
//!
//! This module wraps the errors of the internal crates and presents a
//! consistent interface to users.

use thiserror::Error;

/// All attrstore errors.
///
/// Only setup can fail: every variant describes configuration that could
/// not be loaded or does not describe a usable store. Running out of
/// buffers or memory after setup is fatal and panics instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Reference layout or alignment cannot address arrays
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Option values are out of range or inconsistent
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for attrstore operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error came from option values.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidLayout(_) | Error::InvalidConfig(_))
    }

    /// Check if this error came from parsing configuration text.
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Error::Serialization(_))
    }
}

// Convert from internal core errors
//
// Only validation errors reach this point; buffer exhaustion and capacity
// overflow are raised as panics by the data store.
impl From<attrstore_core::Error> for Error {
    fn from(e: attrstore_core::Error) -> Self {
        use attrstore_core::Error as CoreError;
        match e {
            CoreError::InvalidRefLayout { .. } | CoreError::UnsupportedAlignment { .. } => {
                Error::InvalidLayout(e.to_string())
            }
            _ => Error::InvalidConfig(e.to_string()),
        }
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
