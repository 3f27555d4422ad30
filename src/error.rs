//! Error types for the Presence gateway

use thiserror::Error;

/// Result type alias for Presence operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Presence gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad setting)
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation referenced an unknown or unbound session
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session with this identifier already exists
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// Persistent connection send/receive failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Avatar bridge failure at any lifecycle stage
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Malformed or undecodable audio payload
    #[error("format error: {0}")]
    Format(String),

    /// Audio device error (capture or playback)
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech pipeline error
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
