//! Topic-remapping transport
//!
//! Bridges two meshes that use different topic ids for the same streams.
//! Outgoing messages have internal topic ids rewritten to external ones and
//! incoming messages the reverse. Unmapped topics pass through unchanged.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use mesh_types::{Message, PricedId, TopicId};
use tokio_util::sync::CancellationToken;

use super::{LinkTransport, TransportInfo};
use crate::Result;

/// Wraps another transport and rewrites topic ids
pub struct TopicRemapTransport<T> {
    inner: T,
    to_external: HashMap<TopicId, TopicId>,
    to_internal: HashMap<TopicId, TopicId>,
}

impl<T: LinkTransport> TopicRemapTransport<T> {
    /// `mapping` yields `(internal, external)` pairs
    pub fn new(inner: T, mapping: impl IntoIterator<Item = (TopicId, TopicId)>) -> Self {
        let to_external: HashMap<TopicId, TopicId> = mapping.into_iter().collect();
        let to_internal = to_external
            .iter()
            .map(|(internal, external)| (*external, *internal))
            .collect();
        Self {
            inner,
            to_external,
            to_internal,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

fn remap(map: &HashMap<TopicId, TopicId>, topic: TopicId) -> TopicId {
    map.get(&topic).copied().unwrap_or(topic)
}

fn remap_ids(map: &HashMap<TopicId, TopicId>, ids: BTreeSet<TopicId>) -> BTreeSet<TopicId> {
    ids.into_iter().map(|id| remap(map, id)).collect()
}

fn remap_priced(map: &HashMap<TopicId, TopicId>, ids: BTreeSet<PricedId>) -> BTreeSet<PricedId> {
    ids.into_iter()
        .map(|p| PricedId::new(remap(map, p.id), p.cost))
        .collect()
}

fn remap_message(map: &HashMap<TopicId, TopicId>, message: Message) -> Message {
    match message {
        Message::TopicData { topic, data } => Message::TopicData {
            topic: remap(map, topic),
            data,
        },
        Message::TopicControl { topic, paused } => Message::TopicControl {
            topic: remap(map, topic),
            paused,
        },
        Message::InTopicsChanged { add, remove } => Message::InTopicsChanged {
            add: remap_ids(map, add),
            remove: remap_ids(map, remove),
        },
        Message::OutTopicsChanged { add, remove } => Message::OutTopicsChanged {
            add: remap_priced(map, add),
            remove: remap_ids(map, remove),
        },
        other => other,
    }
}

#[async_trait]
impl<T: LinkTransport> LinkTransport for TopicRemapTransport<T> {
    async fn send(&self, message: Message) -> Result<()> {
        self.inner.send(remap_message(&self.to_external, message)).await
    }

    async fn recv(&self) -> Result<Message> {
        let message = self.inner.recv().await?;
        Ok(remap_message(&self.to_internal, message))
    }

    fn closed_token(&self) -> &CancellationToken {
        self.inner.closed_token()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn transport_info(&self) -> TransportInfo {
        self.inner.transport_info()
    }
}
