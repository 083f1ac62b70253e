//! Error types for hci-bridge.

use thiserror::Error;

use crate::correlation::CorrelationKey;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A frame could not be decoded (bad header, wrong length).
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The byte stream reached end of file.
    #[error("Connection closed")]
    Closed,

    /// I/O error on a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// A command with the same correlation key is already in flight.
    #[error("Duplicate correlation key {0}")]
    DuplicateKey(CorrelationKey),

    /// A reply arrived for a key with no pending command.
    #[error("Unknown correlation key {0}")]
    UnknownKey(CorrelationKey),

    /// The active command set does not implement this HCI command.
    #[error("Unsupported command opcode 0x{0:04X}")]
    UnsupportedCommand(u16),

    /// An interception rule could not be compiled.
    #[error("Interception rule error: {0}")]
    InterceptionConfig(String),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML configuration could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error ends the direction it happened on.
    ///
    /// `Closed` is terminal too, but it is a clean end rather than a failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serial(_))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
