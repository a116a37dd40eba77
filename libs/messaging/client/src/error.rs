use mesh_network::TransportError;
use mesh_types::AddressId;
use thiserror::Error;

/// Client-level errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Client has no address")]
    NoAddress,

    #[error("Client already has address {address}")]
    AddressAlreadyAssigned { address: AddressId },

    #[error("Receiver closed")]
    ReceiverClosed,
}

impl ClientError {
    /// True when the underlying link is gone
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_closed(),
            Self::ReceiverClosed => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
