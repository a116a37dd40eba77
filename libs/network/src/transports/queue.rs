//! In-process queue transport
//!
//! Two [`QueueTransport`]s created together form a connected pair: what one
//! sends the other receives. Both ends share one close token, so closing or
//! dropping either end closes the pair.
//!
//! In raw mode every message is encoded on send and decoded on receive, which
//! exercises the wire format without any sockets.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_codec::{decode_message, encode_message};
use mesh_types::Message;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{LinkTransport, TransportInfo, TransportType};
use crate::link::Link;
use crate::{costs, Result, TransportError};

enum Envelope {
    Message(Message),
    Encoded(Bytes),
}

/// One end of an in-process connection
pub struct QueueTransport {
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: CancellationToken,
    raw: bool,
}

impl QueueTransport {
    /// Create both ends of a connection
    pub fn pair(raw: bool) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let a = Self {
            outgoing: b_tx,
            incoming: Mutex::new(a_rx),
            closed: closed.clone(),
            raw,
        };
        let b = Self {
            outgoing: a_tx,
            incoming: Mutex::new(b_rx),
            closed,
            raw,
        };
        (a, b)
    }

    fn closed_error() -> TransportError {
        TransportError::connection_closed("queue connection closed")
    }
}

impl Drop for QueueTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl LinkTransport for QueueTransport {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Self::closed_error());
        }

        let envelope = if self.raw {
            Envelope::Encoded(encode_message(&message)?)
        } else {
            Envelope::Message(message)
        };

        self.outgoing
            .send(envelope)
            .map_err(|_| Self::closed_error())
    }

    async fn recv(&self) -> Result<Message> {
        let mut incoming = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Self::closed_error()),
            guard = self.incoming.lock() => guard,
        };

        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(Self::closed_error()),
                envelope = incoming.recv() => envelope.ok_or_else(Self::closed_error)?,
            };

            match envelope {
                Envelope::Message(message) => return Ok(message),
                Envelope::Encoded(bytes) => match decode_message(&bytes) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!(error = %e, "Dropping malformed message from queue peer"),
                },
            }
        }
    }

    fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    fn transport_info(&self) -> TransportInfo {
        if self.raw {
            TransportInfo::new(TransportType::RawQueue)
        } else {
            TransportInfo::new(TransportType::Queue)
        }
    }
}

/// Create two connected in-process links at the default queue cost
pub fn create_queue_connection(raw: bool) -> (Arc<Link>, Arc<Link>) {
    let (a, b) = QueueTransport::pair(raw);
    (
        Arc::new(Link::with_valid_cost(a, costs::QUEUE)),
        Arc::new(Link::with_valid_cost(b, costs::QUEUE)),
    )
}
