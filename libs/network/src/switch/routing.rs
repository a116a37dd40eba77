//! Switch routing state and message handling
//!
//! Everything here runs on the switch task. Handlers never fail: send errors
//! to a neighbour are logged and the neighbour is removed once its own reader
//! observes the closure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use mesh_types::{AddressId, ControlData, Message, TopicId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_reader, Command, SwitchSnapshot};
use crate::link::{Inbound, Link, LinkId, PricedChange};
use crate::tracking::{IdTracker, PricedIdTracker};

struct LinkEntry {
    link: Arc<Link>,
    reader: JoinHandle<()>,
}

pub(crate) struct SwitchCore {
    /// Ordered by id, so "first match" means earliest attached
    links: BTreeMap<LinkId, LinkEntry>,
    in_topics: IdTracker,
    out_topics: PricedIdTracker,
    addresses: PricedIdTracker,
    stream_controls: HashMap<TopicId, ControlData>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

async fn send_to(link: &Link, message: Message) {
    if let Err(e) = link.send(message).await {
        debug!(link = link.id(), error = %e, "Failed to send to link");
    }
}

impl SwitchCore {
    pub(crate) fn new(commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self {
            links: BTreeMap::new(),
            in_topics: IdTracker::new(),
            out_topics: PricedIdTracker::new(),
            addresses: PricedIdTracker::new(),
            stream_controls: HashMap::new(),
            commands,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Switch started");
        while let Some(command) = commands.recv().await {
            match command {
                Command::AddLink { link, done } => {
                    self.add_link(link).await;
                    let _ = done.send(());
                }
                Command::RemoveLink { id, done } => {
                    let removed = self.remove_link(id).await;
                    let _ = done.send(removed);
                }
                Command::Received { id, message } => self.on_received(id, message).await,
                Command::ReaderStopped { id, error } => {
                    if self.remove_link(id).await {
                        info!(link = id, reason = %error, "Removed failed link");
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown { done } => {
                    self.shutdown();
                    let _ = done.send(());
                    debug!("Switch stopped");
                    return;
                }
            }
        }
        // readers only hold weak senders, so this means every handle is gone
        debug!("All switch handles dropped");
        self.shutdown();
    }

    fn other_links(&self, except: Option<LinkId>) -> Vec<Arc<Link>> {
        self.links
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, entry)| Arc::clone(&entry.link))
            .collect()
    }

    async fn broadcast(&self, except: Option<LinkId>, message: Message) {
        for link in self.other_links(except) {
            send_to(&link, message.clone()).await;
        }
    }

    async fn replay_controls(&self, link: &Link, topics: &BTreeSet<TopicId>) {
        for topic in topics {
            if let Some(control) = self.stream_controls.get(topic) {
                send_to(link, control.to_message(*topic)).await;
            }
        }
    }

    pub(crate) async fn add_link(&mut self, link: Arc<Link>) {
        let id = link.id();
        if self.links.contains_key(&id) {
            warn!(link = id, "Link already attached");
            return;
        }

        // Tell the newcomer about every route we know
        let known_topics = self.out_topics.items();
        if !known_topics.is_empty() {
            send_to(&link, Message::out_topics_changed(known_topics, [])).await;
        }
        let known_addresses = self.addresses.items();
        if !known_addresses.is_empty() {
            send_to(&link, Message::addresses_changed(known_addresses, [])).await;
        }

        // Routes the newcomer already advertised
        let new_topics = self.out_topics.add_many(link.out_topics());
        if !new_topics.is_empty() {
            self.broadcast(None, Message::out_topics_changed(new_topics, []))
                .await;
        }
        let new_addresses = self.addresses.add_many(link.addresses());
        if !new_addresses.is_empty() {
            self.broadcast(None, Message::addresses_changed(new_addresses, []))
                .await;
        }

        let link_topics = link.in_topics();
        let demanded = self.in_topics.add_many(link_topics.iter().copied());
        self.replay_controls(&link, &link_topics).await;
        self.request_in_topics_change(demanded, BTreeSet::new()).await;

        let reader = spawn_reader(Arc::clone(&link), self.commands.clone());
        info!(
            link = id,
            cost = link.cost(),
            transport = %link.transport_info(),
            "Link added"
        );
        self.links.insert(id, LinkEntry { link, reader });
    }

    pub(crate) async fn remove_link(&mut self, id: LinkId) -> bool {
        let Some(entry) = self.links.remove(&id) else {
            return false;
        };
        entry.reader.abort();
        let link = entry.link;

        let (removed_topics, updated_topics) = self.out_topics.remove_many(link.out_topics());
        let (removed_addresses, updated_addresses) = self.addresses.remove_many(link.addresses());
        let withdrawn = self.in_topics.remove_many(link.in_topics());

        // Topics this link was delivering to us that are still wanted and
        // still offered elsewhere
        let resubscribe: BTreeSet<TopicId> = link
            .recv_topics()
            .into_iter()
            .filter(|topic| !removed_topics.contains(topic) && self.in_topics.contains(*topic))
            .collect();
        self.request_in_topics_change(resubscribe, withdrawn).await;

        if !removed_topics.is_empty() || !updated_topics.is_empty() {
            self.broadcast(
                None,
                Message::out_topics_changed(updated_topics, removed_topics),
            )
            .await;
        }
        if !removed_addresses.is_empty() || !updated_addresses.is_empty() {
            self.broadcast(
                None,
                Message::addresses_changed(updated_addresses, removed_addresses),
            )
            .await;
        }

        info!(link = id, "Link removed");
        true
    }

    /// Subscribe each topic in `add` from its cheapest provider and
    /// unsubscribe each topic in `remove` from whichever link delivers it
    pub(crate) async fn request_in_topics_change(
        &self,
        add: BTreeSet<TopicId>,
        remove: BTreeSet<TopicId>,
    ) {
        let mut changes: BTreeMap<LinkId, (BTreeSet<TopicId>, BTreeSet<TopicId>)> = BTreeMap::new();
        let mut chosen: HashMap<TopicId, LinkId> = HashMap::new();

        for topic in add {
            let cheapest = self
                .links
                .values()
                .filter_map(|entry| {
                    entry
                        .link
                        .out_topic_cost(topic)
                        .map(|cost| (cost, entry.link.id()))
                })
                .min_by_key(|(cost, _)| *cost);

            match cheapest {
                Some((cost, id)) => {
                    debug!(topic, link = id, cost, "Subscribing to topic");
                    chosen.insert(topic, id);
                    changes.entry(id).or_default().0.insert(topic);
                }
                None => debug!(topic, "No provider for topic yet"),
            }
        }

        for topic in remove {
            for (id, entry) in &self.links {
                if entry.link.is_receiving(topic) && chosen.get(&topic) != Some(id) {
                    debug!(topic, link = *id, "Unsubscribing from topic");
                    changes.entry(*id).or_default().1.insert(topic);
                }
            }
        }

        for (id, (add, remove)) in changes {
            if let Some(entry) = self.links.get(&id) {
                send_to(&entry.link, Message::InTopicsChanged { add, remove }).await;
            }
        }
    }

    pub(crate) async fn on_received(&mut self, id: LinkId, message: Message) {
        let Some(entry) = self.links.get(&id) else {
            return;
        };
        let origin = Arc::clone(&entry.link);
        let Some(inbound) = origin.accept(message) else {
            return;
        };

        match inbound {
            Inbound::Message(Message::TopicData { topic, data }) => {
                self.on_stream_message(id, Message::TopicData { topic, data })
                    .await
            }
            Inbound::Message(Message::TopicControl { topic, paused }) => {
                self.stream_controls.insert(topic, ControlData::new(paused));
                self.on_stream_message(id, Message::TopicControl { topic, paused })
                    .await
            }
            Inbound::Message(Message::Addressed {
                address,
                port,
                data,
            }) => {
                self.on_addressed_message(Message::Addressed {
                    address,
                    port,
                    data,
                })
                .await
            }
            Inbound::Message(Message::InTopicsChanged { add, remove }) => {
                self.on_in_topics_changed(&origin, add, remove).await
            }
            Inbound::OutTopicsChanged(change) => self.on_out_topics_changed(id, change).await,
            Inbound::AddressesChanged(change) => self.on_addresses_changed(id, change).await,
            Inbound::Message(other) => {
                warn!(link = id, kind = ?other.kind(), "Dropping unexpected message");
            }
        }
    }

    async fn on_stream_message(&self, origin: LinkId, message: Message) {
        let Some(topic) = message.topic() else {
            return;
        };
        let targets: Vec<Arc<Link>> = self
            .links
            .iter()
            .filter(|(id, entry)| **id != origin && entry.link.has_in_topic(topic))
            .map(|(_, entry)| Arc::clone(&entry.link))
            .collect();

        for link in targets {
            send_to(&link, message.clone()).await;
        }
    }

    async fn on_addressed_message(&self, message: Message) {
        let Message::Addressed { address, .. } = &message else {
            return;
        };
        let address: AddressId = *address;
        let Some(cost) = self.addresses.get(address) else {
            debug!(address, "Dropping message for unknown address");
            return;
        };

        let route = self
            .links
            .values()
            .find(|entry| entry.link.address_cost(address) == Some(cost))
            .map(|entry| Arc::clone(&entry.link));

        match route {
            Some(link) => send_to(&link, message).await,
            None => warn!(address, cost, "No link carries the recorded address route"),
        }
    }

    async fn on_in_topics_changed(
        &mut self,
        origin: &Link,
        add: BTreeSet<TopicId>,
        remove: BTreeSet<TopicId>,
    ) {
        let (demanded, released) = self
            .in_topics
            .change_many(add.iter().copied(), remove.iter().copied());
        self.replay_controls(origin, &add).await;
        self.request_in_topics_change(demanded, released).await;
    }

    async fn on_out_topics_changed(&mut self, origin: LinkId, change: PricedChange) {
        let (changed, removed) = self
            .out_topics
            .change_many(change.add.iter().copied(), change.remove.iter().copied());
        if !changed.is_empty() || !removed.is_empty() {
            self.broadcast(
                Some(origin),
                Message::out_topics_changed(changed, removed),
            )
            .await;
        }

        // Move subscriptions whose provider is no longer the cheapest
        let touched: BTreeSet<TopicId> = change
            .add
            .iter()
            .chain(change.remove.iter())
            .map(|priced| priced.id)
            .filter(|topic| self.in_topics.contains(*topic))
            .collect();

        let mut resubscribe = BTreeSet::new();
        for topic in touched {
            let Some(best) = self.out_topics.get(topic) else {
                continue;
            };
            let provider_cost = self
                .links
                .values()
                .find(|entry| entry.link.is_receiving(topic))
                .map(|entry| entry.link.out_topic_cost(topic));

            let needs_move = match provider_cost {
                None => true,
                Some(None) => true,
                Some(Some(cost)) => cost > best,
            };
            if needs_move {
                resubscribe.insert(topic);
            }
        }

        if !resubscribe.is_empty() {
            self.request_in_topics_change(resubscribe.clone(), resubscribe)
                .await;
        }
    }

    async fn on_addresses_changed(&mut self, origin: LinkId, change: PricedChange) {
        let (changed, removed) = self
            .addresses
            .change_many(change.add, change.remove);
        if !changed.is_empty() || !removed.is_empty() {
            self.broadcast(Some(origin), Message::addresses_changed(changed, removed))
                .await;
        }
    }

    pub(crate) fn snapshot(&self) -> SwitchSnapshot {
        SwitchSnapshot {
            links: self
                .links
                .values()
                .map(|entry| entry.link.snapshot())
                .collect(),
            in_topics: self.in_topics.items(),
            out_topics: self.out_topics.items(),
            addresses: self.addresses.items(),
            stream_controls: self
                .stream_controls
                .iter()
                .map(|(topic, control)| (*topic, *control))
                .collect(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        for (id, entry) in std::mem::take(&mut self.links) {
            entry.reader.abort();
            entry.link.close();
            debug!(link = id, "Closed link on shutdown");
        }
        info!("Switch shut down");
    }
}
