//! # Mesh Client
//!
//! ## Purpose
//!
//! The participant-facing API on top of one [`mesh_network::Link`]:
//!
//! - [`Client`]: subscribe/provide topics, own an address, send addressed
//!   and stream messages
//! - Receivers ([`TopicsReceiver`], [`AddressReceiver`]) filtering the
//!   link's inbound traffic
//! - Topic handles ([`InTopic`], [`OutTopic`], [`SynchronizedInTopic`])
//! - Synchronizers and the [`StreamMerger`] for consuming several topics as
//!   one time-ordered stream
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> mesh_client::Result<()> {
//! use mesh_client::Client;
//! use mesh_network::Switch;
//!
//! let switch = Switch::new();
//! let producer = Client::connect(&switch).await?;
//! let consumer = Client::connect(&switch).await?;
//!
//! producer.provide([7]).await?;
//! let mut receiver = consumer.topics_receiver([7], true).await?;
//! producer.wait_topic_requested(7).await?;
//! producer.send_stream_data(7, &b"hello"[..]).await?;
//! let event = receiver.recv().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod merge;
pub mod receiver;
pub mod sync;
pub mod topic;

pub use client::{
    AddressAllocator, Client, IdGenerator, SequentialAddressAllocator, DYNAMIC_ADDRESS_START,
    DYNAMIC_PORT_START,
};
pub use error::{ClientError, Result};
pub use merge::{
    leading_timestamp, timestamped, MergedItem, StreamMerger, SynchronizedQueue, TimestampFn,
};
pub use receiver::{AddressReceiver, AddressedData, TopicEvent, TopicsReceiver};
pub use sync::{InTopicSynchronizer, PrioritizedInTopicSynchronizer, SequentialInTopicSynchronizer};
pub use topic::{InTopic, OutTopic, SynchronizedInTopic};
