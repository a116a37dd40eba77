//! Cross-topic stream synchronizers
//!
//! A synchronizer is a barrier shared by several topic feeds. Each feed calls
//! [`InTopicSynchronizer::wait_for`] with the timestamp of the item it is
//! about to release; the call resolves only once every other active feed has
//! reached at least that timestamp. Consumers therefore observe one globally
//! time-ordered interleaving of all feeds.
//!
//! Paused feeds leave the barrier and stop holding others back. A feed that
//! resumes rejoins at the current minimum.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use mesh_types::TopicId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Barrier aligning several topic feeds on a shared timestamp
#[async_trait]
pub trait InTopicSynchronizer: Send + Sync {
    /// Wait until `timestamp` may be released for `topic`.
    ///
    /// Returns `false` without waiting when `timestamp` is older than the
    /// last one recorded for `topic`; the caller should drop that item.
    async fn wait_for(&self, topic: TopicId, timestamp: u64) -> bool;

    /// Remove `topic` from, or return it to, the barrier
    fn set_paused(&self, topic: TopicId, paused: bool);

    /// Marks the start of a new receive attempt for `topic`
    fn start_receive(&self, _topic: TopicId) {}

    /// Minimum timestamp across active topics
    fn sync_timestamp(&self) -> Option<u64>;
}

#[derive(Debug, Default)]
struct BarrierState {
    /// Position of every topic taking part in the barrier
    active: HashMap<TopicId, u64>,
    /// Last recorded timestamp per topic, for stale detection
    last: HashMap<TopicId, u64>,
    paused: HashSet<TopicId>,
    priorities: HashMap<TopicId, i32>,
    /// Topics released at their current position since their last
    /// `start_receive`
    done: HashSet<TopicId>,
}

impl BarrierState {
    fn sync_timestamp(&self) -> Option<u64> {
        self.active.values().min().copied()
    }

    fn record(&mut self, topic: TopicId, timestamp: u64) -> bool {
        if let Some(&last) = self.last.get(&topic) {
            if timestamp < last {
                return false;
            }
        }
        self.last.insert(topic, timestamp);
        if !self.paused.contains(&topic) {
            self.active.insert(topic, timestamp);
        }
        true
    }

    /// Returns true when the barrier changed
    fn set_paused(&mut self, topic: TopicId, paused: bool) -> bool {
        if paused {
            self.active.remove(&topic);
            self.done.remove(&topic);
            self.paused.insert(topic)
        } else {
            let was_paused = self.paused.remove(&topic);
            if self.active.contains_key(&topic) {
                return was_paused;
            }
            let at = self
                .sync_timestamp()
                .or_else(|| self.last.get(&topic).copied())
                .unwrap_or(0);
            self.active.insert(topic, at);
            // anything before the rejoin point would run the barrier backwards
            self.last.insert(topic, at);
            true
        }
    }

    fn priority(&self, topic: TopicId) -> i32 {
        self.priorities.get(&topic).copied().unwrap_or(0)
    }

    fn reached(&self, timestamp: u64) -> bool {
        self.sync_timestamp().map_or(true, |sync| sync >= timestamp)
    }

    fn reached_prioritized(&self, topic: TopicId, timestamp: u64) -> bool {
        let Some(sync) = self.sync_timestamp() else {
            return true;
        };
        if timestamp != sync {
            return timestamp < sync;
        }

        let own = self.priority(topic);
        self.active.iter().all(|(&other, &position)| {
            other == topic
                || position != sync
                || self.priority(other) <= own
                || self.done.contains(&other)
        })
    }
}

#[derive(Debug, Default)]
struct Barrier {
    state: Mutex<BarrierState>,
    changed: Notify,
}

impl Barrier {
    async fn wait_until(&self, ready: impl Fn(&BarrierState) -> bool) {
        loop {
            let notified = self.changed.notified();
            if ready(&*self.state.lock()) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, topic: TopicId, timestamp: u64) -> bool {
        let accepted = self.state.lock().record(topic, timestamp);
        if accepted {
            self.changed.notify_waiters();
        } else {
            debug!(topic, timestamp, "Rejected stale timestamp");
        }
        accepted
    }

    fn set_paused(&self, topic: TopicId, paused: bool) {
        if self.state.lock().set_paused(topic, paused) {
            debug!(topic, paused, "Synchronizer topic paused state changed");
            self.changed.notify_waiters();
        }
    }
}

/// Releases items in non-decreasing timestamp order across topics
#[derive(Debug, Default)]
pub struct SequentialInTopicSynchronizer {
    barrier: Barrier,
}

impl SequentialInTopicSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InTopicSynchronizer for SequentialInTopicSynchronizer {
    async fn wait_for(&self, topic: TopicId, timestamp: u64) -> bool {
        if !self.barrier.record(topic, timestamp) {
            return false;
        }
        self.barrier
            .wait_until(|state| state.reached(timestamp))
            .await;
        true
    }

    fn set_paused(&self, topic: TopicId, paused: bool) {
        self.barrier.set_paused(topic, paused);
    }

    fn sync_timestamp(&self) -> Option<u64> {
        self.barrier.state.lock().sync_timestamp()
    }
}

/// Sequential synchronizer that orders ties by topic priority.
///
/// Among topics positioned at the same minimum timestamp, a topic waits for
/// every tied topic with a higher priority to be released first. Topics with
/// equal priority do not wait for each other.
#[derive(Debug, Default)]
pub struct PrioritizedInTopicSynchronizer {
    barrier: Barrier,
}

impl PrioritizedInTopicSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher values are released first; topics default to 0
    pub fn set_priority(&self, topic: TopicId, priority: i32) {
        self.barrier.state.lock().priorities.insert(topic, priority);
        self.barrier.changed.notify_waiters();
    }
}

#[async_trait]
impl InTopicSynchronizer for PrioritizedInTopicSynchronizer {
    async fn wait_for(&self, topic: TopicId, timestamp: u64) -> bool {
        if !self.barrier.record(topic, timestamp) {
            return false;
        }
        self.barrier
            .wait_until(|state| state.reached_prioritized(topic, timestamp))
            .await;

        self.barrier.state.lock().done.insert(topic);
        self.barrier.changed.notify_waiters();
        true
    }

    fn set_paused(&self, topic: TopicId, paused: bool) {
        self.barrier.set_paused(topic, paused);
    }

    fn start_receive(&self, topic: TopicId) {
        self.barrier.state.lock().done.remove(&topic);
    }

    fn sync_timestamp(&self) -> Option<u64> {
        self.barrier.state.lock().sync_timestamp()
    }
}
