//! Link - one endpoint of a connection between two mesh participants
//!
//! A [`Link`] wraps a [`LinkTransport`] and keeps the per-neighbour routing
//! state the [`crate::Switch`] needs:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `in_topics` | topics the neighbour asked us to deliver |
//! | `recv_topics` | topics we asked the neighbour to deliver |
//! | `out_topics` | topics the neighbour can provide, with cost |
//! | `addresses` | addresses reachable through the neighbour, with cost |
//!
//! ## Cost accounting
//!
//! The link's own `cost` is added to every advertisement in both directions:
//! once when an advertisement is sent and once when one is received.
//!
//! ## Receive processing
//!
//! Raw messages pass through [`Link::accept`], which turns advertisements into
//! [`Inbound::OutTopicsChanged`] / [`Inbound::AddressesChanged`] diffs against
//! the previously known entries and collapses redundant subscription changes.
//! [`Link::recv`] combines both steps; the switch calls them separately so
//! all state diffs happen on its single handling path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use mesh_types::{AddressId, Cost, Message, PricedId, TopicId};
use parking_lot::Mutex;
use tracing::debug;

use crate::transports::{LinkTransport, TransportInfo};
use crate::{Result, TransportError};

/// Process-unique link identifier, increasing in creation order
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Advertisement diff produced by a received advertisement.
///
/// `remove` carries the exact previously recorded `(id, cost)` pairs so the
/// receiver can retract precisely what it counted before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricedChange {
    pub add: BTreeSet<PricedId>,
    pub remove: BTreeSet<PricedId>,
}

impl PricedChange {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// A received message after link-level processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Stream data, control, addressed payloads and effective subscription
    /// changes, delivered as-is
    Message(Message),
    /// Topic availability diff, costs include this link
    OutTopicsChanged(PricedChange),
    /// Address reachability diff, costs include this link
    AddressesChanged(PricedChange),
}

#[derive(Debug, Default)]
struct LinkState {
    in_topics: BTreeSet<TopicId>,
    recv_topics: BTreeSet<TopicId>,
    out_topics: BTreeMap<TopicId, Cost>,
    addresses: BTreeMap<AddressId, Cost>,
}

/// Point-in-time copy of a link's routing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub cost: Cost,
    pub transport: TransportInfo,
    pub closed: bool,
    pub in_topics: BTreeSet<TopicId>,
    pub recv_topics: BTreeSet<TopicId>,
    pub out_topics: BTreeMap<TopicId, Cost>,
    pub addresses: BTreeMap<AddressId, Cost>,
}

/// One endpoint of a bidirectional connection
pub struct Link {
    id: LinkId,
    cost: Cost,
    info: TransportInfo,
    transport: Box<dyn LinkTransport>,
    state: Mutex<LinkState>,
    recv_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("cost", &self.cost)
            .field("transport", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Link {
    /// Wrap `transport` in a link with the given nonzero cost
    pub fn new(transport: impl LinkTransport + 'static, cost: Cost) -> Result<Self> {
        if cost == 0 {
            return Err(TransportError::configuration(
                "link cost must be nonzero",
                Some("cost"),
            ));
        }
        Ok(Self::with_valid_cost(transport, cost))
    }

    pub(crate) fn with_valid_cost(transport: impl LinkTransport + 'static, cost: Cost) -> Self {
        debug_assert!(cost > 0);
        let info = transport.transport_info();
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            cost,
            info,
            transport: Box::new(transport),
            state: Mutex::new(LinkState::default()),
            recv_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn transport_info(&self) -> &TransportInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Close the link and its transport; idempotent.
    ///
    /// Pending and future `send`/`recv` calls fail with
    /// [`TransportError::ConnectionClosed`].
    pub fn close(&self) {
        if !self.is_closed() {
            debug!(link = self.id, transport = %self.info, "Closing link");
        }
        self.transport.close();
    }

    /// Resolves once the link is closed from either side
    pub async fn closed(&self) {
        self.transport.closed_token().cancelled().await
    }

    /// Send a message to the neighbour.
    ///
    /// Advertisements are re-priced with this link's cost; subscription
    /// changes update `recv_topics`.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::connection_closed("link closed"));
        }

        let message = self.prepare_outgoing(message);
        let result = tokio::select! {
            biased;
            _ = self.closed() => Err(TransportError::connection_closed("link closed")),
            result = self.transport.send(message) => result,
        };

        if let Err(e) = &result {
            if e.is_closed() {
                self.close();
            }
        }
        result
    }

    /// Receive the next message that carries an effective change
    pub async fn recv(&self) -> Result<Inbound> {
        let _guard = self.recv_lock.lock().await;
        loop {
            let message = self.recv_raw().await?;
            if let Some(inbound) = self.accept(message) {
                return Ok(inbound);
            }
        }
    }

    /// Receive the next message without link-level processing.
    ///
    /// The caller must pass the result to [`Link::accept`] to keep the link's
    /// state consistent.
    pub async fn recv_raw(&self) -> Result<Message> {
        if self.is_closed() {
            return Err(TransportError::connection_closed("link closed"));
        }

        let result = tokio::select! {
            biased;
            _ = self.closed() => Err(TransportError::connection_closed("link closed")),
            result = self.transport.recv() => result,
        };

        if let Err(e) = &result {
            if e.is_closed() {
                self.close();
            }
        }
        result
    }

    /// Apply a received message to the link state.
    ///
    /// Returns `None` when the message carries no effective change.
    pub fn accept(&self, message: Message) -> Option<Inbound> {
        let mut state = self.state.lock();
        match message {
            Message::InTopicsChanged { add, remove } => {
                let previous = state.in_topics.clone();
                state.in_topics.extend(add);
                for topic in &remove {
                    state.in_topics.remove(topic);
                }

                let added: BTreeSet<TopicId> =
                    state.in_topics.difference(&previous).copied().collect();
                let removed: BTreeSet<TopicId> =
                    previous.difference(&state.in_topics).copied().collect();

                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(Inbound::Message(Message::InTopicsChanged {
                        add: added,
                        remove: removed,
                    }))
                }
            }
            Message::OutTopicsChanged { add, remove } => {
                let change = diff_priced(&mut state.out_topics, add, remove, self.cost);
                (!change.is_empty()).then_some(Inbound::OutTopicsChanged(change))
            }
            Message::AddressesChanged { add, remove } => {
                let change = diff_priced(&mut state.addresses, add, remove, self.cost);
                (!change.is_empty()).then_some(Inbound::AddressesChanged(change))
            }
            other => Some(Inbound::Message(other)),
        }
    }

    fn prepare_outgoing(&self, message: Message) -> Message {
        match message {
            Message::InTopicsChanged { add, remove } => {
                let mut state = self.state.lock();
                state.recv_topics.extend(add.iter().copied());
                for topic in &remove {
                    state.recv_topics.remove(topic);
                }
                Message::InTopicsChanged { add, remove }
            }
            Message::OutTopicsChanged { add, remove } => Message::OutTopicsChanged {
                add: add.into_iter().map(|p| p.with_added_cost(self.cost)).collect(),
                remove,
            },
            Message::AddressesChanged { add, remove } => Message::AddressesChanged {
                add: add.into_iter().map(|p| p.with_added_cost(self.cost)).collect(),
                remove,
            },
            other => other,
        }
    }

    /// Topics the neighbour asked us to deliver
    pub fn in_topics(&self) -> BTreeSet<TopicId> {
        self.state.lock().in_topics.clone()
    }

    pub fn has_in_topic(&self, topic: TopicId) -> bool {
        self.state.lock().in_topics.contains(&topic)
    }

    /// Topics we asked the neighbour to deliver
    pub fn recv_topics(&self) -> BTreeSet<TopicId> {
        self.state.lock().recv_topics.clone()
    }

    pub fn is_receiving(&self, topic: TopicId) -> bool {
        self.state.lock().recv_topics.contains(&topic)
    }

    /// Cost of receiving `topic` through this link, if advertised
    pub fn out_topic_cost(&self, topic: TopicId) -> Option<Cost> {
        self.state.lock().out_topics.get(&topic).copied()
    }

    /// Cost of reaching `address` through this link, if advertised
    pub fn address_cost(&self, address: AddressId) -> Option<Cost> {
        self.state.lock().addresses.get(&address).copied()
    }

    pub fn out_topics(&self) -> BTreeSet<PricedId> {
        to_priced(&self.state.lock().out_topics)
    }

    pub fn addresses(&self) -> BTreeSet<PricedId> {
        to_priced(&self.state.lock().addresses)
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let state = self.state.lock();
        LinkSnapshot {
            id: self.id,
            cost: self.cost,
            transport: self.info.clone(),
            closed: self.is_closed(),
            in_topics: state.in_topics.clone(),
            recv_topics: state.recv_topics.clone(),
            out_topics: state.out_topics.clone(),
            addresses: state.addresses.clone(),
        }
    }
}

fn to_priced(map: &BTreeMap<u64, Cost>) -> BTreeSet<PricedId> {
    map.iter()
        .map(|(id, cost)| PricedId::new(*id, *cost))
        .collect()
}

/// Diff a received advertisement against the known entries.
///
/// Removals report the recorded cost. An add that replaces a different cost
/// also reports the old entry as removed; an identical re-advertisement is
/// dropped.
fn diff_priced(
    known: &mut BTreeMap<u64, Cost>,
    add: BTreeSet<PricedId>,
    remove: BTreeSet<u64>,
    link_cost: Cost,
) -> PricedChange {
    let mut change = PricedChange::default();

    for id in remove {
        if let Some(old) = known.remove(&id) {
            change.remove.insert(PricedId::new(id, old));
        }
    }

    for priced in add {
        let priced = priced.with_added_cost(link_cost);
        match known.insert(priced.id, priced.cost) {
            Some(old) if old == priced.cost => continue,
            Some(old) => {
                // replaced an entry from this same batch rather than a counted one
                let replaced = PricedId::new(priced.id, old);
                if !change.add.remove(&replaced) {
                    change.remove.insert(replaced);
                }
            }
            None => {}
        }
        change.add.insert(priced);
    }

    change
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::create_queue_connection;
    use crate::transports::QueueTransport;

    fn priced(pairs: &[(u64, Cost)]) -> BTreeSet<PricedId> {
        pairs.iter().map(|(id, cost)| PricedId::new(*id, *cost)).collect()
    }

    #[test]
    fn test_zero_cost_rejected() {
        let (a, _b) = QueueTransport::pair(false);
        assert!(matches!(
            Link::new(a, 0),
            Err(TransportError::Configuration { .. })
        ));
    }

    #[test]
    fn test_link_ids_are_unique() {
        let (a, b) = create_queue_connection(false);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_send_adds_cost_to_advertisements() {
        let (link_end, raw) = QueueTransport::pair(false);
        let sender = Link::new(link_end, 3).unwrap();
        sender
            .send(Message::addresses_changed(priced(&[(5, 2)]), []))
            .await
            .unwrap();

        assert_eq!(
            raw.recv().await.unwrap(),
            Message::addresses_changed(priced(&[(5, 5)]), [])
        );
    }

    #[tokio::test]
    async fn test_recv_adds_cost_and_reports_old_entries() {
        let (raw, link_end) = QueueTransport::pair(false);
        let link = Link::new(link_end, 3).unwrap();

        raw.send(Message::out_topics_changed(priced(&[(42, 2)]), []))
            .await
            .unwrap();
        assert_eq!(
            link.recv().await.unwrap(),
            Inbound::OutTopicsChanged(PricedChange {
                add: priced(&[(42, 5)]),
                remove: BTreeSet::new(),
            })
        );
        assert_eq!(link.out_topic_cost(42), Some(5));

        // re-priced advertisement retracts the old entry
        raw.send(Message::out_topics_changed(priced(&[(42, 7)]), []))
            .await
            .unwrap();
        assert_eq!(
            link.recv().await.unwrap(),
            Inbound::OutTopicsChanged(PricedChange {
                add: priced(&[(42, 10)]),
                remove: priced(&[(42, 5)]),
            })
        );

        raw.send(Message::out_topics_changed([], [42])).await.unwrap();
        assert_eq!(
            link.recv().await.unwrap(),
            Inbound::OutTopicsChanged(PricedChange {
                add: BTreeSet::new(),
                remove: priced(&[(42, 10)]),
            })
        );
        assert_eq!(link.out_topic_cost(42), None);
    }

    #[test]
    fn test_identical_readvertisement_suppressed() {
        let (_raw, link_end) = QueueTransport::pair(false);
        let link = Link::new(link_end, 1).unwrap();

        assert!(link
            .accept(Message::addresses_changed(priced(&[(9, 1)]), []))
            .is_some());
        assert!(link
            .accept(Message::addresses_changed(priced(&[(9, 1)]), []))
            .is_none());
        assert_eq!(link.address_cost(9), Some(2));
    }

    #[test]
    fn test_duplicate_id_in_one_batch() {
        let (_raw, link_end) = QueueTransport::pair(false);
        let link = Link::new(link_end, 1).unwrap();

        let inbound = link.accept(Message::out_topics_changed(priced(&[(1, 4), (1, 2)]), []));
        // only the last price survives, nothing counted is retracted
        assert_eq!(
            inbound,
            Some(Inbound::OutTopicsChanged(PricedChange {
                add: priced(&[(1, 5)]),
                remove: BTreeSet::new(),
            }))
        );
    }

    #[test]
    fn test_redundant_subscription_changes_collapse() {
        let (_raw, link_end) = QueueTransport::pair(false);
        let link = Link::new(link_end, 1).unwrap();

        assert_eq!(
            link.accept(Message::in_topics_changed([1, 2], [])),
            Some(Inbound::Message(Message::in_topics_changed([1, 2], [])))
        );
        assert_eq!(link.accept(Message::in_topics_changed([1], [])), None);
        assert_eq!(link.accept(Message::in_topics_changed([], [3])), None);
        assert_eq!(
            link.accept(Message::in_topics_changed([3], [2])),
            Some(Inbound::Message(Message::in_topics_changed([3], [2])))
        );
        assert_eq!(link.in_topics(), BTreeSet::from([1, 3]));
    }

    #[tokio::test]
    async fn test_send_tracks_recv_topics() {
        let (a, _b) = create_queue_connection(false);
        a.send(Message::in_topics_changed([4, 5], [])).await.unwrap();
        a.send(Message::in_topics_changed([], [4])).await.unwrap();
        assert_eq!(a.recv_topics(), BTreeSet::from([5]));
        assert!(a.is_receiving(5));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_recv() {
        let (a, b) = create_queue_connection(false);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::task::yield_now().await;

        b.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed { .. })));
        assert!(a.is_closed());
        assert!(matches!(
            a.send(Message::topic_data(1, vec![1])).await,
            Err(TransportError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = create_queue_connection(false);
        a.close();
        a.close();
        a.closed().await;
        assert!(a.is_closed());
    }
}
