//! Error types for the TailProto core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for TailProto operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope is structurally invalid
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    /// Envelope carries a protocol version this build does not speak
    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u64),

    /// Sequence number rejected by the replay window
    #[error("Replayed or stale sequence number {seq}")]
    Replay { seq: u64 },

    /// Batch payload is invalid or too large
    #[error("Invalid batch: {0}")]
    Batch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
