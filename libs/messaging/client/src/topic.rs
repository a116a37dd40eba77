//! Per-topic handles
//!
//! - [`InTopic`]: consumes one topic, tracking provider cost and pause state
//! - [`OutTopic`]: provides one topic, tracking whether anyone requests it
//! - [`SynchronizedInTopic`]: an [`InTopic`] whose data is released through
//!   an [`InTopicSynchronizer`]

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use mesh_network::Inbound;
use mesh_types::{ControlData, Cost, Message, TopicId};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::merge::{leading_timestamp, SynchronizedQueue, TimestampFn};
use crate::receiver::ReceiverGuard;
use crate::sync::InTopicSynchronizer;

#[derive(Debug)]
pub(crate) enum InTopicEvent {
    Cost(Option<Cost>),
    Control(ControlData),
    Data(Bytes),
}

fn in_topic_event(topic: TopicId, inbound: &Inbound) -> Option<InTopicEvent> {
    match inbound {
        Inbound::OutTopicsChanged(change) => {
            if let Some(priced) = change.add.iter().find(|priced| priced.id == topic) {
                Some(InTopicEvent::Cost(Some(priced.cost)))
            } else if change.remove.iter().any(|priced| priced.id == topic) {
                Some(InTopicEvent::Cost(None))
            } else {
                None
            }
        }
        Inbound::Message(Message::TopicControl { topic: t, paused }) if *t == topic => {
            Some(InTopicEvent::Control(ControlData::new(*paused)))
        }
        Inbound::Message(Message::TopicData { topic: t, data }) if *t == topic => {
            Some(InTopicEvent::Data(data.clone()))
        }
        _ => None,
    }
}

/// Consumer handle for one topic.
///
/// The topic is subscribed while the handle is registered; dropping a
/// registered handle unsubscribes in the background.
pub struct InTopic {
    client: Client,
    topic: TopicId,
    registered: bool,
    cost: Option<Cost>,
    control: Option<ControlData>,
    events: mpsc::UnboundedReceiver<InTopicEvent>,
    _guard: ReceiverGuard,
}

impl InTopic {
    pub(crate) fn open(client: Client, topic: TopicId) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let guard = client
            .dispatch()
            .register(Box::new(move |inbound: &Inbound| match in_topic_event(topic, inbound) {
                Some(event) => sender.send(event).is_ok(),
                None => !sender.is_closed(),
            }));
        let cost = client.link().out_topic_cost(topic);

        Self {
            client,
            topic,
            registered: false,
            cost,
            control: None,
            events,
            _guard: guard,
        }
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Cost of the cheapest known provider
    pub fn cost(&self) -> Option<Cost> {
        self.cost
    }

    pub fn is_available(&self) -> bool {
        self.cost.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_some_and(|control| control.paused)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Subscribe or unsubscribe the topic
    pub async fn set_registered(&mut self, registered: bool) -> Result<()> {
        if self.registered == registered {
            return Ok(());
        }
        if registered {
            self.client.register_in_topics([self.topic]).await?;
        } else {
            self.client.unregister_in_topics([self.topic]).await?;
        }
        self.registered = registered;
        Ok(())
    }

    /// Next data payload; control and cost updates are applied on the way
    pub async fn recv(&mut self) -> Result<Bytes> {
        loop {
            if let InTopicEvent::Data(data) = self.next_event().await? {
                return Ok(data);
            }
        }
    }

    pub(crate) async fn next_event(&mut self) -> Result<InTopicEvent> {
        let event = self.events.recv().await.ok_or(ClientError::ReceiverClosed)?;
        match &event {
            InTopicEvent::Cost(cost) => self.cost = *cost,
            InTopicEvent::Control(control) => self.control = Some(*control),
            InTopicEvent::Data(_) => {}
        }
        Ok(event)
    }
}

impl Drop for InTopic {
    fn drop(&mut self) {
        if self.registered {
            self.client
                .unregister_in_topics_detached(BTreeSet::from([self.topic]));
        }
    }
}

/// Provider handle for one topic.
///
/// The topic is advertised while the handle is registered; dropping a
/// registered handle withdraws it in the background.
pub struct OutTopic {
    client: Client,
    topic: TopicId,
    registered: bool,
    paused: bool,
    requested: watch::Receiver<BTreeSet<TopicId>>,
    _guard: ReceiverGuard,
}

impl OutTopic {
    pub(crate) fn open(client: Client, topic: TopicId) -> Self {
        // keeps the dispatcher running so requests are tracked
        let guard = client.dispatch().register(Box::new(|_: &Inbound| true));
        let requested = client.dispatch().requested();
        Self {
            client,
            topic,
            registered: false,
            paused: false,
            requested,
            _guard: guard,
        }
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a neighbour currently asks for this topic
    pub fn is_requested(&self) -> bool {
        self.requested.borrow().contains(&self.topic)
    }

    /// Resolves once the requested state equals `requested`
    pub async fn wait_requested(&mut self, requested: bool) -> Result<()> {
        let topic = self.topic;
        let link = Arc::clone(self.client.link());
        tokio::select! {
            result = self.requested.wait_for(|topics| topics.contains(&topic) == requested) => {
                result.map(|_| ()).map_err(|_| ClientError::ReceiverClosed)
            }
            _ = link.closed() => Err(ClientError::ReceiverClosed),
        }
    }

    /// Advertise or withdraw the topic
    pub async fn set_registered(&mut self, registered: bool) -> Result<()> {
        if self.registered == registered {
            return Ok(());
        }
        if registered {
            self.client.register_out_topics([self.topic]).await?;
        } else {
            self.client.unregister_out_topics([self.topic]).await?;
        }
        self.registered = registered;
        Ok(())
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.client.send_stream_data(self.topic, data).await
    }

    /// Send a control message if the pause state changes
    pub async fn set_paused(&mut self, paused: bool) -> Result<()> {
        if self.paused == paused {
            return Ok(());
        }
        self.client
            .send_stream_control(self.topic, ControlData::new(paused))
            .await?;
        self.paused = paused;
        Ok(())
    }
}

impl Drop for OutTopic {
    fn drop(&mut self) {
        if self.registered {
            self.client
                .unregister_out_topics_detached(BTreeSet::from([self.topic]));
        }
    }
}

/// [`InTopic`] whose data is released in synchronizer order.
///
/// Every payload must carry its timestamp; the default extractor reads a
/// big-endian `u64` prefix (see [`crate::timestamped`]). Payloads without a
/// timestamp are dropped. Pause control messages pause the topic in the
/// synchronizer once the data received before them has been released.
pub struct SynchronizedInTopic {
    in_topic: InTopic,
    queue: SynchronizedQueue,
    timestamp: TimestampFn,
}

impl SynchronizedInTopic {
    pub(crate) fn open(client: Client, topic: TopicId, sync: Arc<dyn InTopicSynchronizer>) -> Self {
        Self {
            in_topic: InTopic::open(client, topic),
            queue: SynchronizedQueue::new(topic, sync),
            timestamp: leading_timestamp,
        }
    }

    /// Replace the payload timestamp extractor
    pub fn with_timestamp_fn(mut self, timestamp: TimestampFn) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn topic(&self) -> TopicId {
        self.in_topic.topic()
    }

    pub fn in_topic(&self) -> &InTopic {
        &self.in_topic
    }

    pub async fn set_registered(&mut self, registered: bool) -> Result<()> {
        self.in_topic.set_registered(registered).await
    }

    /// Next payload with its timestamp, once the synchronizer releases it
    pub async fn recv(&mut self) -> Result<(u64, Bytes)> {
        loop {
            tokio::select! {
                released = self.queue.pop() => {
                    if let Some(item) = released {
                        return Ok(item);
                    }
                }
                event = self.in_topic.next_event() => match event? {
                    InTopicEvent::Data(data) => match (self.timestamp)(&data) {
                        Some(timestamp) => self.queue.put(timestamp, data),
                        None => warn!(topic = self.queue.topic(), "Dropped payload without timestamp"),
                    },
                    InTopicEvent::Control(control) => self.queue.put_control(control),
                    InTopicEvent::Cost(_) => {}
                },
            }
        }
    }
}
