//! Error types for the streaming session engine

use thiserror::Error;

/// Errors surfaced by the engine, the transport and the registry.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport-level failure (connect, TLS, body read)
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("Backend error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A second reader was about to be registered on a session
    #[error("Session '{0}' already has an active reader")]
    SessionBusy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Abort requested while nothing is streaming
    #[error("No stream is active")]
    NotStreaming,

    /// Send/retry/edit requested on a conversation that is still streaming
    #[error("Conversation '{0}' is already streaming")]
    AlreadyStreaming(String),

    #[error("Invalid authorization URL: {0}")]
    InvalidAuthUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while reading the response body mid-stream
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ChatError>;
