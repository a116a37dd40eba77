//! # Switch - Per-Process Message Router
//!
//! ## Purpose
//!
//! Aggregates the routing state of every attached [`Link`] and forwards
//! stream, addressed and control-plane messages between them:
//!
//! - **Least-cost subscription**: each demanded topic is requested from
//!   exactly one link, the one advertising it at the lowest cost, and moved
//!   when a cheaper provider appears or the current one goes away.
//! - **Fan-out**: topic data and control go to every other link that asked
//!   for the topic.
//! - **Addressed routing**: point-to-point payloads go to the first link
//!   offering the globally cheapest route to the address.
//! - **Advertisement propagation**: only effective changes to the aggregated
//!   topic and address minimums are forwarded to neighbours.
//!
//! ## Architecture
//!
//! ```text
//!  reader task (link 1) ─┐
//!  reader task (link 2) ─┼─► command channel ─► SwitchCore (single owner of
//!  Switch handle calls  ─┘                       all routing state)
//! ```
//!
//! One reader task per link pulls raw messages and forwards them to the core,
//! which applies link-level diffs and routing decisions on a single path. A
//! reader that fails (closure or I/O error) reports it and the core removes
//! that link; nothing else is affected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mesh_types::{ControlData, Message, PricedId, TopicId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::link::{Link, LinkId, LinkSnapshot};
use crate::transports::create_queue_connection;
use crate::{Result, TransportError};

mod routing;

use routing::SwitchCore;

/// Point-in-time copy of the switch's aggregated state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchSnapshot {
    pub links: Vec<LinkSnapshot>,
    /// Topics demanded by at least one link
    pub in_topics: BTreeSet<TopicId>,
    /// Cheapest known cost per provided topic
    pub out_topics: BTreeSet<PricedId>,
    /// Cheapest known cost per reachable address
    pub addresses: BTreeSet<PricedId>,
    /// Last seen pause state per topic
    pub stream_controls: BTreeMap<TopicId, ControlData>,
}

impl SwitchSnapshot {
    pub fn link(&self, id: LinkId) -> Option<&LinkSnapshot> {
        self.links.iter().find(|link| link.id == id)
    }
}

pub(crate) enum Command {
    AddLink {
        link: Arc<Link>,
        done: oneshot::Sender<()>,
    },
    RemoveLink {
        id: LinkId,
        done: oneshot::Sender<bool>,
    },
    Received {
        id: LinkId,
        message: Message,
    },
    ReaderStopped {
        id: LinkId,
        error: TransportError,
    },
    Snapshot {
        reply: oneshot::Sender<SwitchSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running switch; cheap to clone
#[derive(Clone)]
pub struct Switch {
    commands: mpsc::UnboundedSender<Command>,
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

impl Switch {
    /// Start a switch on the current tokio runtime
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let core = SwitchCore::new(commands.downgrade());
        tokio::spawn(core.run(receiver));
        Self { commands }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| TransportError::SwitchStopped)?;
        response.await.map_err(|_| TransportError::SwitchStopped)
    }

    /// Attach a link and start its receive loop
    pub async fn add_link(&self, link: Arc<Link>) -> Result<()> {
        self.request(|done| Command::AddLink { link, done }).await
    }

    /// Detach a link; returns false if it was not attached.
    ///
    /// The link itself stays open.
    pub async fn remove_link(&self, id: LinkId) -> Result<bool> {
        self.request(|done| Command::RemoveLink { id, done }).await
    }

    /// Create an in-process connection, attach one end and return the other
    pub async fn add_local_connection(&self) -> Result<Arc<Link>> {
        self.add_connection(false).await
    }

    /// Like [`Switch::add_local_connection`] but every message crosses the codec
    pub async fn add_serialized_connection(&self) -> Result<Arc<Link>> {
        self.add_connection(true).await
    }

    async fn add_connection(&self, raw: bool) -> Result<Arc<Link>> {
        let (switch_end, user_end) = create_queue_connection(raw);
        self.add_link(switch_end).await?;
        Ok(user_end)
    }

    pub async fn snapshot(&self) -> Result<SwitchSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop every receive loop, close all links and stop the switch.
    ///
    /// Dropping the last handle has the same effect.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|done| Command::Shutdown { done }).await
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Pull raw messages from `link` into the switch until it fails.
///
/// Holds only a weak sender so a switch whose handles are all dropped stops
/// even while links are still open.
pub(crate) fn spawn_reader(
    link: Arc<Link>,
    commands: mpsc::WeakUnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = link.id();
        loop {
            let result = link.recv_raw().await;
            let Some(commands) = commands.upgrade() else {
                break;
            };
            match result {
                Ok(message) => {
                    if commands.send(Command::Received { id, message }).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(link = id, error = %error, "Link receive loop ended");
                    let _ = commands.send(Command::ReaderStopped { id, error });
                    break;
                }
            }
        }
    })
}
