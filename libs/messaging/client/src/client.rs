//! Client facade over one link
//!
//! A [`Client`] is what a worker uses to take part in the mesh: it
//! subscribes to and provides topics, owns at most one address, sends
//! addressed and stream messages, and hands out receivers.
//!
//! Topic registrations are refcounted: only the first registration and the
//! last unregistration of a topic reach the link.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use mesh_network::{IdTracker, Inbound, Link, Switch, TransportError};
use mesh_types::{ids_to_priced_ids, AddressId, ControlData, Message, Port, TopicId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::receiver::{AddressReceiver, Dispatch, TopicsReceiver};
use crate::sync::InTopicSynchronizer;
use crate::topic::{InTopic, OutTopic, SynchronizedInTopic};

/// First port handed out by [`Client::get_free_port`]
pub const DYNAMIC_PORT_START: Port = 10_000;

/// First address handed out by the default allocator
pub const DYNAMIC_ADDRESS_START: AddressId = 1 << 32;

/// Sequential id source that wraps back to `start` after `end - 1`
#[derive(Debug, Clone)]
pub struct IdGenerator {
    start: u64,
    end: u64,
    current: u64,
}

impl IdGenerator {
    /// Ids in `start..end`; an empty range yields `start` forever
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start.saturating_add(1)),
            current: start,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.current;
        self.current = if id + 1 >= self.end { self.start } else { id + 1 };
        id
    }
}

/// Source of fresh addresses for [`Client::request_address`]
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    async fn allocate(&self) -> Result<AddressId>;
}

/// Hands out consecutive addresses from an in-process counter
#[derive(Debug)]
pub struct SequentialAddressAllocator {
    next: AtomicU64,
}

impl SequentialAddressAllocator {
    pub const fn new(start: AddressId) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

#[async_trait]
impl AddressAllocator for SequentialAddressAllocator {
    async fn allocate(&self) -> Result<AddressId> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

fn default_allocator() -> Arc<dyn AddressAllocator> {
    static DEFAULT: OnceLock<Arc<SequentialAddressAllocator>> = OnceLock::new();
    let allocator = DEFAULT
        .get_or_init(|| Arc::new(SequentialAddressAllocator::new(DYNAMIC_ADDRESS_START)));
    Arc::clone(allocator) as Arc<dyn AddressAllocator>
}

#[derive(Debug, Default)]
struct Registrations {
    in_topics: IdTracker,
    out_topics: IdTracker,
    address: Option<AddressId>,
}

struct ClientInner {
    link: Arc<Link>,
    dispatch: Arc<Dispatch>,
    /// Held across the link send so registrations reach the link in order
    registrations: tokio::sync::Mutex<Registrations>,
    address: Mutex<Option<AddressId>>,
    ports: Mutex<IdGenerator>,
    allocator: Arc<dyn AddressAllocator>,
}

/// Mesh participant bound to one link
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("link", &self.inner.link)
            .field("address", &self.address())
            .finish()
    }
}

impl Client {
    pub fn new(link: Arc<Link>) -> Self {
        Self::with_allocator(link, default_allocator())
    }

    pub fn with_allocator(link: Arc<Link>, allocator: Arc<dyn AddressAllocator>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dispatch: Dispatch::new(Arc::clone(&link)),
                link,
                registrations: tokio::sync::Mutex::new(Registrations::default()),
                address: Mutex::new(None),
                ports: Mutex::new(IdGenerator::new(DYNAMIC_PORT_START, u64::MAX)),
                allocator,
            }),
        }
    }

    /// Attach a new in-process connection to `switch` and wrap its far end
    pub async fn connect(switch: &Switch) -> Result<Self> {
        Ok(Self::new(switch.add_local_connection().await?))
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.inner.link
    }

    pub(crate) fn dispatch(&self) -> &Arc<Dispatch> {
        &self.inner.dispatch
    }

    pub fn address(&self) -> Option<AddressId> {
        *self.inner.address.lock()
    }

    pub fn get_free_port(&self) -> Port {
        self.inner.ports.lock().next_id()
    }

    /// Close the underlying link
    pub fn close(&self) {
        self.inner.link.close();
    }

    pub async fn register_in_topics(&self, topics: impl IntoIterator<Item = TopicId>) -> Result<()> {
        let mut registrations = self.inner.registrations.lock().await;
        let added = registrations.in_topics.add_many(topics);
        if !added.is_empty() {
            debug!(topics = ?added, "Subscribing");
            self.inner
                .link
                .send(Message::in_topics_changed(added, []))
                .await?;
        }
        Ok(())
    }

    /// Unregister topics; topics that are not registered are ignored
    pub async fn unregister_in_topics(
        &self,
        topics: impl IntoIterator<Item = TopicId>,
    ) -> Result<()> {
        let mut registrations = self.inner.registrations.lock().await;
        let known: Vec<TopicId> = topics
            .into_iter()
            .filter(|topic| registrations.in_topics.contains(*topic))
            .collect();
        let removed = registrations.in_topics.remove_many(known);
        if !removed.is_empty() {
            debug!(topics = ?removed, "Unsubscribing");
            self.inner
                .link
                .send(Message::in_topics_changed([], removed))
                .await?;
        }
        Ok(())
    }

    pub async fn register_out_topics(
        &self,
        topics: impl IntoIterator<Item = TopicId>,
    ) -> Result<()> {
        let mut registrations = self.inner.registrations.lock().await;
        let added = registrations.out_topics.add_many(topics);
        if !added.is_empty() {
            debug!(topics = ?added, "Providing");
            self.inner
                .link
                .send(Message::out_topics_changed(ids_to_priced_ids(added, 0), []))
                .await?;
        }
        Ok(())
    }

    /// Unregister provided topics; topics that are not registered are ignored
    pub async fn unregister_out_topics(
        &self,
        topics: impl IntoIterator<Item = TopicId>,
    ) -> Result<()> {
        let mut registrations = self.inner.registrations.lock().await;
        let known: Vec<TopicId> = topics
            .into_iter()
            .filter(|topic| registrations.out_topics.contains(*topic))
            .collect();
        let removed = registrations.out_topics.remove_many(known);
        if !removed.is_empty() {
            debug!(topics = ?removed, "Withdrawing");
            self.inner
                .link
                .send(Message::out_topics_changed([], removed))
                .await?;
        }
        Ok(())
    }

    pub async fn subscribe(&self, topics: impl IntoIterator<Item = TopicId>) -> Result<()> {
        self.register_in_topics(topics).await
    }

    pub async fn unsubscribe(&self, topics: impl IntoIterator<Item = TopicId>) -> Result<()> {
        self.unregister_in_topics(topics).await
    }

    pub async fn provide(&self, topics: impl IntoIterator<Item = TopicId>) -> Result<()> {
        self.register_out_topics(topics).await
    }

    pub async fn unprovide(&self, topics: impl IntoIterator<Item = TopicId>) -> Result<()> {
        self.unregister_out_topics(topics).await
    }

    /// Topics currently subscribed through this client
    pub async fn in_topics(&self) -> BTreeSet<TopicId> {
        self.inner.registrations.lock().await.in_topics.items()
    }

    /// Topics currently provided through this client
    pub async fn out_topics(&self) -> BTreeSet<TopicId> {
        self.inner.registrations.lock().await.out_topics.items()
    }

    pub(crate) fn unregister_in_topics_detached(&self, topics: BTreeSet<TopicId>) {
        self.detached(move |client| async move { client.unregister_in_topics(topics).await });
    }

    pub(crate) fn unregister_out_topics_detached(&self, topics: BTreeSet<TopicId>) {
        self.detached(move |client| async move { client.unregister_out_topics(topics).await });
    }

    fn detached<F, Fut>(&self, task: F)
    where
        F: FnOnce(Client) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let future = task(self.clone());
        handle.spawn(async move {
            if let Err(e) = future.await {
                debug!(error = %e, "Background unregistration failed");
            }
        });
    }

    /// Replace the client's address, advertising the change
    pub async fn set_address(&self, address: Option<AddressId>) -> Result<()> {
        let mut registrations = self.inner.registrations.lock().await;
        let previous = registrations.address;
        if previous != address {
            let add: BTreeSet<AddressId> = address.into_iter().collect();
            let remove: BTreeSet<AddressId> = previous.into_iter().collect();
            self.inner
                .link
                .send(Message::addresses_changed(ids_to_priced_ids(add, 0), remove))
                .await?;
        }
        registrations.address = address;
        *self.inner.address.lock() = address;
        Ok(())
    }

    /// Allocate a fresh address and assign it to this client
    pub async fn request_address(&self) -> Result<AddressId> {
        if let Some(address) = self.address() {
            return Err(ClientError::AddressAlreadyAssigned { address });
        }
        let address = self.inner.allocator.allocate().await?;
        self.set_address(Some(address)).await?;
        info!(address, "Address assigned");
        Ok(address)
    }

    pub async fn send_to(&self, address: AddressId, port: Port, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::addressed(address, port, data)).await
    }

    pub async fn send_stream_data(&self, topic: TopicId, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::topic_data(topic, data)).await
    }

    pub async fn send_stream_control(&self, topic: TopicId, control: ControlData) -> Result<()> {
        self.send(control.to_message(topic)).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.inner.link.send(message).await.map_err(ClientError::from)
    }

    /// Provided topics a neighbour currently requests
    pub fn requested_topics(&self) -> BTreeSet<TopicId> {
        self.inner.link.in_topics()
    }

    /// Resolves once a neighbour requests `topic`
    pub async fn wait_topic_requested(&self, topic: TopicId) -> Result<()> {
        self.wait_requested(topic, true).await
    }

    /// Resolves once no neighbour requests `topic`
    pub async fn wait_topic_released(&self, topic: TopicId) -> Result<()> {
        self.wait_requested(topic, false).await
    }

    async fn wait_requested(&self, topic: TopicId, requested: bool) -> Result<()> {
        let _guard = self.inner.dispatch.register(Box::new(|_: &Inbound| true));
        let mut topics = self.inner.dispatch.requested();
        let link = Arc::clone(&self.inner.link);
        tokio::select! {
            result = topics.wait_for(|topics| topics.contains(&topic) == requested) => {
                result.map(|_| ()).map_err(|_| ClientError::ReceiverClosed)
            }
            _ = link.closed() => {
                Err(TransportError::connection_closed("link closed while waiting").into())
            }
        }
    }

    /// Receiver for data and control on `topics`, subscribing them if
    /// `subscribe` is set
    pub async fn topics_receiver(
        &self,
        topics: impl IntoIterator<Item = TopicId>,
        subscribe: bool,
    ) -> Result<TopicsReceiver> {
        TopicsReceiver::open(self.clone(), topics.into_iter().collect(), subscribe).await
    }

    /// Receiver for addressed messages; `None` accepts every port
    pub fn address_receiver(
        &self,
        addresses: impl IntoIterator<Item = AddressId>,
        port: Option<Port>,
    ) -> AddressReceiver {
        AddressReceiver::open(self, addresses.into_iter().collect(), port)
    }

    pub fn in_topic(&self, topic: TopicId) -> InTopic {
        InTopic::open(self.clone(), topic)
    }

    pub fn out_topic(&self, topic: TopicId) -> OutTopic {
        OutTopic::open(self.clone(), topic)
    }

    pub fn sync_in_topic(
        &self,
        topic: TopicId,
        sync: Arc<dyn InTopicSynchronizer>,
    ) -> SynchronizedInTopic {
        SynchronizedInTopic::open(self.clone(), topic, sync)
    }
}
