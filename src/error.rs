//! Rallypoint Error Types

use thiserror::Error;

/// Result type alias for Rallypoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// Rallypoint error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Connection errors
    #[error("Failed to connect to coordination store: {0}")]
    Connect(String),

    // Registration errors
    #[error("Registration conflict at {path}: entry is owned by {owner}")]
    RegistrationConflict { path: String, owner: String },

    // Store errors
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Protocol violation: {0}")]
    FatalProtocol(String),

    // Lifecycle errors
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Check if this error means the ephemeral registration is gone
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionLost(_))
    }
}
