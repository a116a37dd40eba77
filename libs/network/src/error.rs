//! Transport Error Types
//!
//! Error handling for links, transports, servers and the switch.

use thiserror::Error;

use mesh_codec::ProtocolError;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link or its peer has gone away
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Establishing a connection failed
    #[error("Connection error: {message} (remote: {remote:?})")]
    Connection {
        message: String,
        remote: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Protocol and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<ProtocolError>,
    },

    /// Connection handshake rejected or malformed
    #[error("Handshake error: {reason}")]
    Handshake { reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// The switch task is no longer running
    #[error("Switch stopped")]
    SwitchStopped,
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a connection-closed error
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote: Option<String>) -> Self {
        Self::Connection {
            message: message.into(),
            remote,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handshake error
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// True when the error means the link can no longer be used
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::Io { .. })
    }
}

impl From<ProtocolError> for TransportError {
    fn from(error: ProtocolError) -> Self {
        if let ProtocolError::Handshake { reason } = error {
            return Self::Handshake { reason };
        }
        Self::Protocol {
            message: error.to_string(),
            source: Some(error),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
            source: error,
        }
    }
}
