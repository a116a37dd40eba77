//! Wire message variants
//!
//! The six variants are the complete vocabulary spoken between neighbours.
//! Every variant maps to a stable one-byte [`MessageKind`] used on the wire.

use std::collections::BTreeSet;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::{AddressId, PricedId, Port, TopicId};

/// Wire discriminant for each message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    TopicData = 0,
    TopicControl = 1,
    Addressed = 2,
    AddressesChanged = 3,
    InTopicsChanged = 4,
    OutTopicsChanged = 5,
}

/// Flow control state for a stream topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ControlData {
    pub paused: bool,
}

impl ControlData {
    pub const fn new(paused: bool) -> Self {
        Self { paused }
    }

    /// Wrap into a [`Message::TopicControl`] for `topic`
    pub fn to_message(self, topic: TopicId) -> Message {
        Message::TopicControl {
            topic,
            paused: self.paused,
        }
    }
}

/// A message exchanged over a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Stream payload published on a topic
    TopicData { topic: TopicId, data: Bytes },
    /// Pause or resume marker for a topic
    TopicControl { topic: TopicId, paused: bool },
    /// Point-to-point payload for a port at an address
    Addressed {
        address: AddressId,
        port: Port,
        data: Bytes,
    },
    /// Reachability diff for addresses
    AddressesChanged {
        add: BTreeSet<PricedId>,
        remove: BTreeSet<AddressId>,
    },
    /// Subscription diff: topics the sender now wants to receive
    InTopicsChanged {
        add: BTreeSet<TopicId>,
        remove: BTreeSet<TopicId>,
    },
    /// Availability diff: topics the sender can now provide
    OutTopicsChanged {
        add: BTreeSet<PricedId>,
        remove: BTreeSet<TopicId>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::TopicData { .. } => MessageKind::TopicData,
            Message::TopicControl { .. } => MessageKind::TopicControl,
            Message::Addressed { .. } => MessageKind::Addressed,
            Message::AddressesChanged { .. } => MessageKind::AddressesChanged,
            Message::InTopicsChanged { .. } => MessageKind::InTopicsChanged,
            Message::OutTopicsChanged { .. } => MessageKind::OutTopicsChanged,
        }
    }

    /// Topic carried by stream messages
    pub fn topic(&self) -> Option<TopicId> {
        match self {
            Message::TopicData { topic, .. } | Message::TopicControl { topic, .. } => Some(*topic),
            _ => None,
        }
    }

    pub fn topic_data(topic: TopicId, data: impl Into<Bytes>) -> Self {
        Message::TopicData {
            topic,
            data: data.into(),
        }
    }

    pub fn addressed(address: AddressId, port: Port, data: impl Into<Bytes>) -> Self {
        Message::Addressed {
            address,
            port,
            data: data.into(),
        }
    }

    pub fn in_topics_changed(
        add: impl IntoIterator<Item = TopicId>,
        remove: impl IntoIterator<Item = TopicId>,
    ) -> Self {
        Message::InTopicsChanged {
            add: add.into_iter().collect(),
            remove: remove.into_iter().collect(),
        }
    }

    pub fn out_topics_changed(
        add: impl IntoIterator<Item = PricedId>,
        remove: impl IntoIterator<Item = TopicId>,
    ) -> Self {
        Message::OutTopicsChanged {
            add: add.into_iter().collect(),
            remove: remove.into_iter().collect(),
        }
    }

    pub fn addresses_changed(
        add: impl IntoIterator<Item = PricedId>,
        remove: impl IntoIterator<Item = AddressId>,
    ) -> Self {
        Message::AddressesChanged {
            add: add.into_iter().collect(),
            remove: remove.into_iter().collect(),
        }
    }
}
