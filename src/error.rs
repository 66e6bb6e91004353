//! Error types for framewire.

use thiserror::Error;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Endpoint string could not be used (empty name, malformed address).
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Protocol error (oversized frame, corrupt header).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session is shutting down or already torn down.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;
