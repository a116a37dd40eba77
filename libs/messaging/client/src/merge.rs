//! Synchronized stream merging
//!
//! [`SynchronizedQueue`] buffers one topic's items sorted by timestamp and
//! releases its head only once the bound synchronizer accepts that
//! timestamp. [`StreamMerger`] binds one synchronizer to several queues and
//! exposes them as a single time-ordered stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use mesh_types::{ControlData, TopicId};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::sync::InTopicSynchronizer;

/// Size of the timestamp prefix written by [`timestamped`]
pub const TIMESTAMP_SIZE: usize = 8;

/// Extracts the ordering timestamp from a payload
pub type TimestampFn = fn(&[u8]) -> Option<u64>;

/// Read a big-endian `u64` timestamp from the start of `payload`
pub fn leading_timestamp(payload: &[u8]) -> Option<u64> {
    let prefix: [u8; TIMESTAMP_SIZE] = payload.get(..TIMESTAMP_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

/// Prefix `payload` with a timestamp readable by [`leading_timestamp`]
pub fn timestamped(timestamp: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TIMESTAMP_SIZE + payload.len());
    buf.put_u64(timestamp);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Debug)]
enum QueueItem {
    Data(Bytes),
    Control(ControlData),
}

enum Head {
    Data(u64),
    Control(ControlData),
    Empty,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<(u64, u64), QueueItem>,
    seq: u64,
    /// Highest timestamp put so far; controls are ordered after it
    latest: u64,
    /// Head taken out while its release is awaited
    pending: Option<(u64, Bytes)>,
    closed: bool,
}

/// Timestamp-sorted buffer for one topic, gated by a synchronizer.
///
/// Control items queue behind the data put before them and pause or resume
/// the topic in the synchronizer when they reach the head. Creating a queue
/// enters its topic into the synchronizer at the current minimum. A drained,
/// closed queue pauses its topic so it no longer holds other topics back.
pub struct SynchronizedQueue {
    topic: TopicId,
    sync: Arc<dyn InTopicSynchronizer>,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl SynchronizedQueue {
    pub fn new(topic: TopicId, sync: Arc<dyn InTopicSynchronizer>) -> Self {
        sync.set_paused(topic, false);
        Self {
            topic,
            sync,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
        }
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn put(&self, timestamp: u64, data: Bytes) {
        self.insert(Some(timestamp), QueueItem::Data(data));
    }

    /// Queue a control item behind everything put so far
    pub fn put_control(&self, control: ControlData) {
        self.insert(None, QueueItem::Control(control));
    }

    fn insert(&self, timestamp: Option<u64>, item: QueueItem) {
        {
            let mut state = self.state.lock();
            let timestamp = timestamp.unwrap_or(state.latest);
            state.latest = state.latest.max(timestamp);
            let seq = state.seq;
            state.seq += 1;
            state.items.insert((timestamp, seq), item);
        }
        self.changed.notify_one();
    }

    /// Pause or resume the topic immediately
    pub fn set_paused(&self, paused: bool) {
        self.sync.set_paused(self.topic, paused);
    }

    /// No more items will be put; `pop` drains what is buffered then ends
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_one();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + usize::from(state.pending.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the next item once the synchronizer allows it.
    ///
    /// Items the synchronizer rejects as stale are dropped. Returns `None`
    /// once the queue is closed and drained. Cancel-safe: an interrupted call
    /// keeps its item for the next one.
    pub async fn pop(&self) -> Option<(u64, Bytes)> {
        loop {
            let notified = self.changed.notified();
            let head = {
                let mut state = self.state.lock();
                if let Some((timestamp, _)) = &state.pending {
                    Head::Data(*timestamp)
                } else {
                    match state.items.pop_first() {
                        Some(((timestamp, _), QueueItem::Data(data))) => {
                            state.pending = Some((timestamp, data));
                            Head::Data(timestamp)
                        }
                        Some((_, QueueItem::Control(control))) => Head::Control(control),
                        None if state.closed => Head::Closed,
                        None => Head::Empty,
                    }
                }
            };

            let timestamp = match head {
                Head::Data(timestamp) => timestamp,
                Head::Control(control) => {
                    self.sync.set_paused(self.topic, control.paused);
                    continue;
                }
                Head::Empty => {
                    notified.await;
                    continue;
                }
                Head::Closed => {
                    self.sync.set_paused(self.topic, true);
                    return None;
                }
            };

            self.sync.start_receive(self.topic);
            let accepted = self.sync.wait_for(self.topic, timestamp).await;

            let Some((timestamp, data)) = self.state.lock().pending.take() else {
                continue;
            };
            if accepted {
                return Some((timestamp, data));
            }
            debug!(topic = self.topic, timestamp, "Dropped stale item");
        }
    }
}

impl Drop for SynchronizedQueue {
    fn drop(&mut self) {
        self.sync.set_paused(self.topic, true);
    }
}

/// One item of a merged stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedItem {
    pub topic: TopicId,
    pub timestamp: u64,
    pub data: Bytes,
}

/// Binds one synchronizer to several per-topic queues
pub struct StreamMerger {
    sync: Arc<dyn InTopicSynchronizer>,
    queues: BTreeMap<TopicId, Arc<SynchronizedQueue>>,
}

impl StreamMerger {
    pub fn new(sync: Arc<dyn InTopicSynchronizer>) -> Self {
        Self {
            sync,
            queues: BTreeMap::new(),
        }
    }

    /// Queue for `topic`, created on first use
    pub fn queue(&mut self, topic: TopicId) -> Arc<SynchronizedQueue> {
        let sync = &self.sync;
        Arc::clone(
            self.queues
                .entry(topic)
                .or_insert_with(|| Arc::new(SynchronizedQueue::new(topic, Arc::clone(sync)))),
        )
    }

    pub fn synchronizer(&self) -> &Arc<dyn InTopicSynchronizer> {
        &self.sync
    }

    /// All queues as one stream, ending when every queue is closed and drained
    pub fn into_stream(self) -> BoxStream<'static, MergedItem> {
        let feeds = self.queues.into_values().map(|queue| {
            stream::unfold(queue, |queue| async move {
                let (timestamp, data) = queue.pop().await?;
                let item = MergedItem {
                    topic: queue.topic(),
                    timestamp,
                    data,
                };
                Some((item, queue))
            })
            .boxed()
        });
        stream::select_all(feeds).boxed()
    }
}
