//! Error handling for the watch engine
//!
//! A single error type covers all engine operations. Underlying library
//! errors convert automatically via `thiserror`.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// TOML configuration serialize error
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A device address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The engine is shutting down and no longer accepts commands
    #[error("Engine stopped")]
    EngineStopped,
}
