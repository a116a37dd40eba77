//! Message receivers
//!
//! A client's link is read by one dispatcher task, started when the first
//! receiver registers and stopped when the last one goes away. Every inbound
//! message is offered to every registered receiver; each receiver filters
//! what it wants into its own channel.
//!
//! Stream data and control for topics the client is not subscribed to are
//! dropped before dispatch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use mesh_network::{Inbound, Link};
use mesh_types::{AddressId, ControlData, Message, Port, TopicId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::Client;
use crate::error::{ClientError, Result};

/// Offers an inbound message to a receiver; returns false once the
/// receiver is gone
pub(crate) type Deliver = Box<dyn FnMut(&Inbound) -> bool + Send>;

#[derive(Default)]
struct DispatchState {
    next_id: u64,
    slots: Vec<(u64, Deliver)>,
    task: Option<JoinHandle<()>>,
}

/// Receiver registry and dispatcher for one link
pub(crate) struct Dispatch {
    link: Arc<Link>,
    state: Mutex<DispatchState>,
    /// Topics the neighbour currently asks this client to provide
    requested: watch::Sender<BTreeSet<TopicId>>,
}

impl Dispatch {
    pub(crate) fn new(link: Arc<Link>) -> Arc<Self> {
        let (requested, _) = watch::channel(link.in_topics());
        Arc::new(Self {
            link,
            state: Mutex::new(DispatchState::default()),
            requested,
        })
    }

    pub(crate) fn register(self: &Arc<Self>, deliver: Deliver) -> ReceiverGuard {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.slots.push((id, deliver));

        let running = state.task.as_ref().is_some_and(|task| !task.is_finished());
        if !running {
            state.task = Some(tokio::spawn(Arc::clone(self).run()));
        }

        ReceiverGuard {
            dispatch: Arc::clone(self),
            id,
        }
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state.lock();
        state.slots.retain(|(slot, _)| *slot != id);
        if state.slots.is_empty() {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }

    pub(crate) fn requested(&self) -> watch::Receiver<BTreeSet<TopicId>> {
        self.requested.subscribe()
    }

    async fn run(self: Arc<Self>) {
        debug!(link = self.link.id(), "Client dispatcher started");
        loop {
            let inbound = match self.link.recv().await {
                Ok(inbound) => inbound,
                Err(e) => {
                    debug!(link = self.link.id(), error = %e, "Client dispatcher stopped");
                    break;
                }
            };

            match &inbound {
                Inbound::Message(Message::InTopicsChanged { .. }) => {
                    self.requested.send_replace(self.link.in_topics());
                }
                Inbound::Message(message) => {
                    if let Some(topic) = message.topic() {
                        if !self.link.is_receiving(topic) {
                            trace!(topic, "Dropped data for unsubscribed topic");
                            continue;
                        }
                    }
                }
                _ => {}
            }

            self.state
                .lock()
                .slots
                .retain_mut(|(_, deliver)| deliver(&inbound));
        }

        // closes every receiver channel
        self.state.lock().slots.clear();
    }
}

/// Keeps a receiver registered; unregisters on drop
pub(crate) struct ReceiverGuard {
    dispatch: Arc<Dispatch>,
    id: u64,
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        self.dispatch.unregister(self.id);
    }
}

/// Stream event delivered by a [`TopicsReceiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    Data { topic: TopicId, data: Bytes },
    Control { topic: TopicId, control: ControlData },
}

impl TopicEvent {
    pub fn topic(&self) -> TopicId {
        match self {
            Self::Data { topic, .. } | Self::Control { topic, .. } => *topic,
        }
    }
}

/// Receives data and control for a set of topics
pub struct TopicsReceiver {
    client: Client,
    topics: BTreeSet<TopicId>,
    subscribed: bool,
    controls: HashMap<TopicId, ControlData>,
    events: mpsc::UnboundedReceiver<TopicEvent>,
    _guard: ReceiverGuard,
}

impl TopicsReceiver {
    /// Registers the receiver, then subscribes to `topics` if `subscribe`
    pub(crate) async fn open(
        client: Client,
        topics: BTreeSet<TopicId>,
        subscribe: bool,
    ) -> Result<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        let wanted = topics.clone();
        let guard = client.dispatch().register(Box::new(move |inbound: &Inbound| {
            let event = match inbound {
                Inbound::Message(Message::TopicData { topic, data }) if wanted.contains(topic) => {
                    TopicEvent::Data {
                        topic: *topic,
                        data: data.clone(),
                    }
                }
                Inbound::Message(Message::TopicControl { topic, paused })
                    if wanted.contains(topic) =>
                {
                    TopicEvent::Control {
                        topic: *topic,
                        control: ControlData::new(*paused),
                    }
                }
                _ => return !sender.is_closed(),
            };
            sender.send(event).is_ok()
        }));

        let mut receiver = Self {
            client,
            topics,
            subscribed: false,
            controls: HashMap::new(),
            events,
            _guard: guard,
        };
        if subscribe && !receiver.topics.is_empty() {
            receiver
                .client
                .register_in_topics(receiver.topics.iter().copied())
                .await?;
            receiver.subscribed = true;
        }
        Ok(receiver)
    }

    pub fn topics(&self) -> &BTreeSet<TopicId> {
        &self.topics
    }

    /// Last control state seen for `topic`
    pub fn control_data(&self, topic: TopicId) -> Option<ControlData> {
        self.controls.get(&topic).copied()
    }

    pub async fn recv(&mut self) -> Result<TopicEvent> {
        let event = self.events.recv().await.ok_or(ClientError::ReceiverClosed)?;
        if let TopicEvent::Control { topic, control } = &event {
            self.controls.insert(*topic, *control);
        }
        Ok(event)
    }

    /// Unsubscribe and stop receiving
    pub async fn close(mut self) -> Result<()> {
        if std::mem::take(&mut self.subscribed) {
            self.client
                .unregister_in_topics(self.topics.iter().copied())
                .await?;
        }
        Ok(())
    }
}

impl Drop for TopicsReceiver {
    fn drop(&mut self) {
        if self.subscribed {
            self.client
                .unregister_in_topics_detached(self.topics.iter().copied().collect());
        }
    }
}

/// Payload received by an [`AddressReceiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedData {
    pub address: AddressId,
    pub port: Port,
    pub data: Bytes,
}

/// Receives addressed messages for a set of addresses, optionally one port
pub struct AddressReceiver {
    addresses: BTreeSet<AddressId>,
    port: Option<Port>,
    messages: mpsc::UnboundedReceiver<AddressedData>,
    _guard: ReceiverGuard,
}

impl AddressReceiver {
    pub(crate) fn open(client: &Client, addresses: BTreeSet<AddressId>, port: Option<Port>) -> Self {
        let (sender, messages) = mpsc::unbounded_channel();
        let wanted = addresses.clone();
        let guard = client.dispatch().register(Box::new(move |inbound: &Inbound| match inbound {
            Inbound::Message(Message::Addressed {
                address,
                port: target,
                data,
            }) if wanted.contains(address) && port.map_or(true, |port| port == *target) => sender
                .send(AddressedData {
                    address: *address,
                    port: *target,
                    data: data.clone(),
                })
                .is_ok(),
            _ => !sender.is_closed(),
        }));

        Self {
            addresses,
            port,
            messages,
            _guard: guard,
        }
    }

    pub fn addresses(&self) -> &BTreeSet<AddressId> {
        &self.addresses
    }

    pub fn port(&self) -> Option<Port> {
        self.port
    }

    pub async fn recv(&mut self) -> Result<AddressedData> {
        self.messages.recv().await.ok_or(ClientError::ReceiverClosed)
    }
}
