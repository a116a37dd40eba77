//! # Mesh Network - Links, Transports and the Switch
//!
//! ## Purpose
//!
//! Everything needed to connect mesh participants and route between them:
//!
//! - [`tracking`]: refcounted id sets reporting only effective changes
//! - [`Link`]: one endpoint of a connection plus its neighbour's routing state
//! - [`transports`]: in-process queues, framed TCP/Unix streams, topic remapping
//! - [`Switch`]: per-process router doing least-cost subscription, fan-out
//!   and addressed delivery
//! - [`server`] / [`reconnect`]: accepting and maintaining stream connections
//!
//! ## Architecture Role
//!
//! ```text
//! mesh-codec ──► [mesh-network] ──► mesh-client, mesh-node
//! ```

pub mod error;
pub mod link;
pub mod reconnect;
pub mod server;
pub mod switch;
pub mod tracking;
pub mod transports;

pub use error::{Result, TransportError};
pub use link::{Inbound, Link, LinkId, LinkSnapshot, PricedChange};
pub use reconnect::AutoReconnector;
pub use server::{ConnectionTracker, ServerOptions, TcpLinkServer, UnixLinkServer};
pub use switch::{Switch, SwitchSnapshot};
pub use tracking::{IdTracker, PricedIdTracker};
pub use transports::{
    connect_tcp, connect_unix, create_queue_connection, ConnectOptions, LinkTransport,
    QueueTransport, StreamTransport, TopicRemapTransport, TransportInfo, TransportType,
};

use std::time::Duration;

pub use mesh_config::defaults::costs;

/// Time allowed for the connection handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration =
    Duration::from_millis(mesh_config::defaults::connections::HANDSHAKE_TIMEOUT_MS);
