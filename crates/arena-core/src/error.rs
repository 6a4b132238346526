//! Error types shared across the arena crates

use std::path::PathBuf;
use thiserror::Error;

/// A session could not be established
#[derive(Debug, Clone, Error)]
#[error("Cannot connect to {address}: {reason}")]
pub struct ConnectionError {
    /// Address that was dialled
    pub address: String,
    /// Human-readable cause
    pub reason: String,
}

impl ConnectionError {
    pub fn new(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// Session-local failure. Isolated to a single pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Peer went away, or the session already failed
    #[error("Session disconnected")]
    Disconnected,

    /// Read or write exceeded the configured timeout
    #[error("Session timed out")]
    Timeout,

    /// Malformed record or out-of-order message
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
