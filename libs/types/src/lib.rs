//! # Mesh Types - Wire Message Model
//!
//! ## Purpose
//!
//! Shared vocabulary for every component of the mesh: identifiers, priced
//! identifiers and the six wire message variants exchanged over links.
//! Everything here is plain data; encoding lives in `mesh-codec` and routing
//! in `mesh-network`.
//!
//! ## Architecture Role
//!
//! ```text
//! mesh-types ──► mesh-codec ──► mesh-network (Link, Switch) ──► mesh-client
//! ```
//!
//! ## Message Families
//!
//! - **Stream**: [`Message::TopicData`] and [`Message::TopicControl`] flow from
//!   providers to subscribers along the cheapest advertised path.
//! - **Addressed**: [`Message::Addressed`] is delivered point-to-point towards
//!   the cheapest route to an address.
//! - **Control plane**: [`Message::AddressesChanged`],
//!   [`Message::InTopicsChanged`] and [`Message::OutTopicsChanged`] carry
//!   reachability and subscription diffs between neighbours.

pub mod ids;
pub mod message;

pub use ids::{ids_to_priced_ids, AddressId, Cost, PricedId, Port, TopicId};
pub use message::{ControlData, Message, MessageKind};
