//! Link Transports
//!
//! A transport moves whole [`Message`]s between the two ends of one
//! connection. It knows nothing about costs or subscriptions; that state lives
//! in [`crate::Link`], which wraps exactly one transport.
//!
//! ## Implementations
//!
//! - [`queue`]: in-process pair of channels, optionally serializing every
//!   message through the codec
//! - [`stream`]: framed byte stream over TCP or Unix sockets
//! - [`remap`]: wraps another transport and rewrites topic ids
//!
//! Every transport exposes a [`CancellationToken`] that is cancelled once the
//! connection is closed from either side. Cancelling it must unblock pending
//! `send`/`recv` calls.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mesh_types::Message;
use tokio_util::sync::CancellationToken;

use crate::{Result, TransportError};

pub mod queue;
pub mod remap;
pub mod stream;


pub use queue::{create_queue_connection, QueueTransport};
pub use remap::TopicRemapTransport;
pub use stream::{connect_tcp, connect_unix, ConnectOptions, FramedStream, StreamTransport};

/// Message transport under a [`crate::Link`]
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Send one message to the peer
    async fn send(&self, message: Message) -> Result<()>;

    /// Receive the next message from the peer
    async fn recv(&self) -> Result<Message>;

    /// Receive with timeout
    async fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| TransportError::timeout("recv", timeout.as_millis() as u64))?
    }

    /// Token cancelled when the connection closes
    fn closed_token(&self) -> &CancellationToken;

    /// Close the connection; idempotent
    fn close(&self) {
        self.closed_token().cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed_token().is_cancelled()
    }

    /// Transport-specific information for logs and snapshots
    fn transport_info(&self) -> TransportInfo;
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// In-process channel pair
    Queue,
    /// In-process channel pair carrying encoded bytes
    RawQueue,
    /// TCP network transport
    Tcp,
    /// Unix domain socket transport
    Unix,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Queue => "queue",
            TransportType::RawQueue => "raw-queue",
            TransportType::Tcp => "tcp",
            TransportType::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// Transport information for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub transport_type: TransportType,
    pub remote_address: Option<String>,
}

impl TransportInfo {
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            remote_address: None,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote_address = Some(remote.into());
        self
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote_address {
            Some(remote) => write!(f, "{}://{}", self.transport_type, remote),
            None => write!(f, "{}", self.transport_type),
        }
    }
}
