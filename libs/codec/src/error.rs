//! Protocol-level errors for message encoding and stream framing
//!
//! Each variant carries enough context to tell a truncated read apart from a
//! corrupted or foreign byte stream when it shows up in the logs.

use thiserror::Error;

/// Encoding, framing and handshake failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer ended before a field could be read
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Leading discriminant does not name a known message variant
    #[error("Unknown message kind {kind}: valid kinds are 0-5")]
    UnknownMessageKind { kind: u8 },

    /// A field holds a value outside its domain
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Bytes left over after the last field of a message
    #[error("Trailing bytes after message: {remaining} unread")]
    TrailingBytes { remaining: usize },

    /// Frame length exceeds the configured ceiling
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Handshake payload could not be parsed or was rejected
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },
}

impl ProtocolError {
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
