//! Error types for brewflash.

use std::io;
use thiserror::Error;

/// Result type for brewflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for brewflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The serial link could not be opened, or did not come back after flashing.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed outgoing packet or an unexpected reply where a specific one is required.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A structured payload from the device could not be parsed.
    #[error("Cannot decode '{tag}' response: {reason}")]
    Decode {
        /// Tag character of the offending line.
        tag: char,
        /// Parser message.
        reason: String,
    },

    /// Packet transfer did not complete.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// External programmer failed.
    #[error("Programmer failed: {0}")]
    Tool(String),

    /// Firmware image is unreadable or unsuitable.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Version string could not be parsed.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Operation not allowed in the current handle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
