//! # Mesh Protocol Codec
//!
//! ## Purpose
//!
//! The "rules" layer between plain message types and transports:
//! - Binary encoding/decoding of the six wire message variants
//! - Sync-word framing for byte-stream transports
//! - Handshake payloads exchanged when a stream connection opens
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/network
//!     ↑           ↓            ↓
//! Pure Data   Encoding     Transports
//! Message     Framing      Sockets, queues
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in network/)
//! - Routing state or subscription bookkeeping

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use error::{ProtocolError, Result};
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, SYNC_WORD};
pub use handshake::{protocol_version, HandshakeRequest, HandshakeResponse};
pub use message::{decode_message, encode_message, encoded_len};
