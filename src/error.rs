//! Error types for Floodgate.
//!
//! Only setup can fail. Admission decisions, including rejections, are plain
//! values and never surface as errors.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy failed validation at registration time
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// Two policies (or speed limiters) share a name
    #[error("Duplicate policy name: {0}")]
    DuplicatePolicy(String),

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    pub(crate) fn invalid_policy(name: &str, reason: impl Into<String>) -> Self {
        FloodgateError::InvalidPolicy {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
