//! Error types for trace analysis
//!
//! Only environment failures surface here: unreadable streams, invalid
//! manifests or configuration. Malformed trace lines, missing pairs and
//! degenerate numerics are result states, not errors.

use thiserror::Error;

/// Errors raised by the analysis engine and its collaborators
#[derive(Debug, Error)]
pub enum BisectarError {
    /// Opening or reading a trace stream failed
    #[error("I/O error: {message}")]
    IoError {
        /// Description including the source that failed
        message: String,
    },

    /// A structured document (manifest, config, report) could not be decoded
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the decode failure
        reason: String,
    },

    /// Caller-supplied configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BisectarError>;

impl From<std::io::Error> for BisectarError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BisectarError {
    fn from(err: serde_json::Error) -> Self {
        Self::FormatError {
            reason: err.to_string(),
        }
    }
}
