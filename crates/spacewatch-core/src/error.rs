//! Error types for the `spacewatch` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `spacewatch` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required executable could not be found
    #[error("Missing '{program}'. Place {program} in a local bin folder or add it to PATH.")]
    MissingDependency { program: String },

    /// The URL is not a Space URL
    #[error("Invalid Space URL: {0}")]
    InvalidUrl(String),

    /// Failed to persist an error log entry
    #[error("Error log at {path} could not be written: {reason}")]
    ErrorLog { path: PathBuf, reason: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
