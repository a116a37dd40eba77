//! End-to-end scenarios
//!
//! Each scenario builds a small multi-switch topology on a [`MeshHarness`]
//! and checks one routing behaviour through real clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use mesh_client::{
    timestamped, Client, InTopicSynchronizer, SequentialInTopicSynchronizer, TopicEvent,
    TopicsReceiver,
};
use mesh_network::{
    connect_tcp, AutoReconnector, ConnectOptions, ServerOptions, TcpLinkServer, UnixLinkServer,
};
use mesh_types::{ControlData, PricedId, TopicId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::framework::{MeshHarness, TestScenario};

/// Every scenario, in run order
pub fn all_scenarios() -> Vec<Box<dyn TestScenario>> {
    vec![
        Box::new(LeastCostFailover),
        Box::new(AddressedAcrossHops),
        Box::new(ControlReplay),
        Box::new(TopicRemapBridge),
        Box::new(ReconnectAfterRestart),
        Box::new(SynchronizedFeeds),
        Box::new(RejectedHandshake),
    ]
}

/// Wait for the next data payload on `topic`, skipping control events
async fn next_data(
    mesh: &MeshHarness,
    receiver: &mut TopicsReceiver,
    topic: TopicId,
) -> Result<Bytes> {
    mesh.within(&format!("data on topic {topic}"), async {
        loop {
            match receiver.recv().await? {
                TopicEvent::Data { topic: t, data } if t == topic => {
                    return Ok::<_, anyhow::Error>(data)
                }
                _ => continue,
            }
        }
    })
    .await?
}

/// Two providers of one topic at different path costs. The consumer must be
/// served by the cheaper one and fail over when it disappears.
pub struct LeastCostFailover;

#[async_trait]
impl TestScenario for LeastCostFailover {
    fn name(&self) -> &str {
        "least_cost_failover"
    }

    fn description(&self) -> &str {
        "Subscription follows the cheapest provider and fails over"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        const TOPIC: TopicId = 42;

        let west_link = mesh.link_tcp("hub", "west", 5, None).await?;
        let east_link = mesh.link_unix("hub", "east", 3).await?;
        let west = mesh.client("west").await?;
        let east = mesh.client("east").await?;
        let consumer = mesh.client("hub").await?;
        let hub = mesh.switch("hub");

        west.provide([TOPIC]).await?;
        east.provide([TOPIC]).await?;

        // client→switch adds 1 twice, each switch hop adds its cost twice
        mesh.wait_for_snapshot(&hub, "east advertisement", |s| {
            s.out_topics.contains(&PricedId::new(TOPIC, 2 + 2 * 3))
        })
        .await?;

        let mut receiver = consumer.topics_receiver([TOPIC], true).await?;
        mesh.within("east requested", east.wait_topic_requested(TOPIC))
            .await??;
        mesh.within("west released", west.wait_topic_released(TOPIC))
            .await??;

        east.send_stream_data(TOPIC, &b"from east"[..]).await?;
        let data = next_data(mesh, &mut receiver, TOPIC).await?;
        ensure!(data == &b"from east"[..], "unexpected payload {data:?}");

        info!("Dropping east link");
        east_link.close();
        mesh.wait_for_snapshot(&hub, "west advertisement", |s| {
            s.out_topics.contains(&PricedId::new(TOPIC, 2 + 2 * 5))
        })
        .await?;
        mesh.within("west requested", west.wait_topic_requested(TOPIC))
            .await??;

        west.send_stream_data(TOPIC, &b"from west"[..]).await?;
        let data = next_data(mesh, &mut receiver, TOPIC).await?;
        ensure!(data == &b"from west"[..], "unexpected payload {data:?}");

        drop(west_link);
        Ok(2)
    }
}

/// Addressed payloads cross two hops to the client owning the address
pub struct AddressedAcrossHops;

#[async_trait]
impl TestScenario for AddressedAcrossHops {
    fn name(&self) -> &str {
        "addressed_across_hops"
    }

    fn description(&self) -> &str {
        "Addressed messages route over a chain of switches"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        mesh.link_queue("a", "b", 2).await?;
        mesh.link_tcp("b", "c", 10, None).await?;
        let sender = mesh.client("a").await?;
        let owner = mesh.client("c").await?;

        let address = owner.request_address().await?;
        let port = owner.get_free_port();
        let mut inbox = owner.address_receiver([address], Some(port));

        let a = mesh.switch("a");
        mesh.wait_for_snapshot(&a, "address route", |s| {
            s.addresses.iter().any(|priced| priced.id == address)
        })
        .await?;

        // the wrong port is filtered out by the receiver
        sender.send_to(address, port + 1, &b"ignored"[..]).await?;
        sender.send_to(address, port, &b"hello"[..]).await?;

        let message = mesh.within("addressed message", inbox.recv()).await??;
        ensure!(message.port == port, "wrong port {}", message.port);
        ensure!(message.data == &b"hello"[..], "unexpected payload");
        Ok(1)
    }
}

/// A late subscriber two hops away learns the current pause state before
/// any data
pub struct ControlReplay;

#[async_trait]
impl TestScenario for ControlReplay {
    fn name(&self) -> &str {
        "control_replay"
    }

    fn description(&self) -> &str {
        "Pause state is replayed to new subscribers"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        const TOPIC: TopicId = 7;

        mesh.link_queue("source", "relay", 1).await?;
        mesh.link_unix("relay", "sink", 4).await?;
        let producer = mesh.client("source").await?;
        let consumer = mesh.client("sink").await?;

        producer.provide([TOPIC]).await?;
        producer
            .send_stream_control(TOPIC, ControlData::new(true))
            .await?;
        let source = mesh.switch("source");
        mesh.wait_for_snapshot(&source, "recorded pause", |s| {
            s.stream_controls.get(&TOPIC) == Some(&ControlData::new(true))
        })
        .await?;

        let sink = mesh.switch("sink");
        mesh.wait_for_snapshot(&sink, "topic advertisement", |s| {
            s.out_topics.iter().any(|priced| priced.id == TOPIC)
        })
        .await?;
        let mut receiver = consumer.topics_receiver([TOPIC], true).await?;

        let event = mesh.within("replayed control", receiver.recv()).await??;
        ensure!(
            event
                == TopicEvent::Control {
                    topic: TOPIC,
                    control: ControlData::new(true),
                },
            "expected a replayed pause, got {event:?}"
        );

        producer
            .send_stream_control(TOPIC, ControlData::new(false))
            .await?;
        producer.send_stream_data(TOPIC, &b"resumed"[..]).await?;
        let data = next_data(mesh, &mut receiver, TOPIC).await?;
        ensure!(data == &b"resumed"[..], "unexpected payload");
        ensure!(
            receiver.control_data(TOPIC) == Some(ControlData::new(false)),
            "resume was not observed"
        );
        Ok(1)
    }
}

/// Two meshes agree on a stream under different topic ids
pub struct TopicRemapBridge;

#[async_trait]
impl TestScenario for TopicRemapBridge {
    fn name(&self) -> &str {
        "topic_remap_bridge"
    }

    fn description(&self) -> &str {
        "Topic ids are rewritten across a remapping link"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        const INTERNAL: TopicId = 1;
        const EXTERNAL: TopicId = 1001;

        mesh.link_remapped("inside", "outside", 1, vec![(INTERNAL, EXTERNAL)])
            .await?;
        let producer = mesh.client("inside").await?;
        let consumer = mesh.client("outside").await?;

        producer.provide([INTERNAL]).await?;
        let outside = mesh.switch("outside");
        mesh.wait_for_snapshot(&outside, "remapped advertisement", |s| {
            s.out_topics.iter().any(|priced| priced.id == EXTERNAL)
                && !s.out_topics.iter().any(|priced| priced.id == INTERNAL)
        })
        .await?;

        let mut receiver = consumer.topics_receiver([EXTERNAL], true).await?;
        mesh.within("internal topic requested", producer.wait_topic_requested(INTERNAL))
            .await??;

        producer.send_stream_data(INTERNAL, &b"bridged"[..]).await?;
        let data = next_data(mesh, &mut receiver, EXTERNAL).await?;
        ensure!(data == &b"bridged"[..], "unexpected payload");
        Ok(1)
    }
}

/// An auto-reconnecting edge finds its hub again after the hub restarts
pub struct ReconnectAfterRestart;

#[async_trait]
impl TestScenario for ReconnectAfterRestart {
    fn name(&self) -> &str {
        "reconnect_after_restart"
    }

    fn description(&self) -> &str {
        "Auto reconnector re-attaches after the listener comes back"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        const TOPIC: TopicId = 9;
        let path = mesh.socket_path("hub");

        let first_hub = mesh.switch("first-hub");
        let listener = UnixLinkServer::bind(&path, first_hub.clone(), ServerOptions::default())
            .await?;
        let connections = listener.connections();
        let server = tokio::spawn(listener.run());

        let edge = mesh.switch("edge");
        let reconnector = AutoReconnector::unix(
            edge.clone(),
            path.clone(),
            ConnectOptions::default(),
            Duration::from_millis(50),
        );
        let mut status = reconnector.status();
        mesh.spawn(reconnector.run());

        mesh.within("first connection", connections.wait_for(|count| count == 1))
            .await?;
        wait_status(mesh, &mut status, true).await?;

        info!("Restarting hub");
        server.abort();
        let _ = server.await;
        first_hub.shutdown().await?;
        wait_status(mesh, &mut status, false).await?;

        let second_hub = mesh.switch("second-hub");
        let listener = UnixLinkServer::bind(&path, second_hub.clone(), ServerOptions::default())
            .await?;
        mesh.spawn(async move {
            let _ = listener.run().await;
        });
        wait_status(mesh, &mut status, true).await?;

        let producer = mesh.client("edge").await?;
        let consumer = mesh.client("second-hub").await?;
        producer.provide([TOPIC]).await?;
        mesh.wait_for_snapshot(&second_hub, "edge advertisement", |s| {
            s.out_topics.iter().any(|priced| priced.id == TOPIC)
        })
        .await?;
        let mut receiver = consumer.topics_receiver([TOPIC], true).await?;
        mesh.within("topic requested", producer.wait_topic_requested(TOPIC))
            .await??;

        producer.send_stream_data(TOPIC, &b"again"[..]).await?;
        let data = next_data(mesh, &mut receiver, TOPIC).await?;
        ensure!(data == &b"again"[..], "unexpected payload");
        Ok(1)
    }
}

async fn wait_status(
    mesh: &MeshHarness,
    status: &mut watch::Receiver<bool>,
    connected: bool,
) -> Result<()> {
    let what = if connected { "connection" } else { "disconnection" };
    mesh.within(what, status.wait_for(|state| *state == connected))
        .await?
        .map(|_| ())
        .context("reconnector stopped")
}

/// Feeds from two remote producers are released in timestamp order
pub struct SynchronizedFeeds;

#[async_trait]
impl TestScenario for SynchronizedFeeds {
    fn name(&self) -> &str {
        "synchronized_feeds"
    }

    fn description(&self) -> &str {
        "Synchronized topics interleave remote feeds by timestamp"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        mesh.link_tcp("hub", "trades", 20, None).await?;
        mesh.link_queue("hub", "quotes", 1).await?;
        let trades = mesh.client("trades").await?;
        let quotes = mesh.client("quotes").await?;
        let consumer = mesh.client("hub").await?;

        let sync: Arc<dyn InTopicSynchronizer> = Arc::new(SequentialInTopicSynchronizer::new());
        let mut trade_topic = consumer.sync_in_topic(1, Arc::clone(&sync));
        let mut quote_topic = consumer.sync_in_topic(2, Arc::clone(&sync));

        trades.provide([1]).await?;
        quotes.provide([2]).await?;
        let hub = mesh.switch("hub");
        mesh.wait_for_snapshot(&hub, "both advertisements", |s| {
            [1, 2]
                .iter()
                .all(|topic| s.out_topics.iter().any(|priced| priced.id == *topic))
        })
        .await?;
        trade_topic.set_registered(true).await?;
        quote_topic.set_registered(true).await?;
        mesh.within("trades requested", trades.wait_topic_requested(1))
            .await??;
        mesh.within("quotes requested", quotes.wait_topic_requested(2))
            .await??;

        let released = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        for mut topic in [trade_topic, quote_topic] {
            let released = Arc::clone(&released);
            readers.push(tokio::spawn(async move {
                while let Ok((timestamp, _)) = topic.recv().await {
                    released.lock().push((topic.topic(), timestamp));
                }
            }));
        }

        publish(&trades, 1, &[100, 105, 130]).await?;
        publish(&quotes, 2, &[101, 110, 120]).await?;
        // the quote feed ends; trades at 130 may now pass
        quotes
            .send_stream_control(2, ControlData::new(true))
            .await?;

        let outcome = mesh
            .within("six releases", async {
                while released.lock().len() < 6 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
        for reader in readers {
            reader.abort();
        }
        outcome?;

        let order = released.lock().clone();
        let expected = vec![(1, 100), (2, 101), (1, 105), (2, 110), (2, 120), (1, 130)];
        if order != expected {
            bail!("release order {order:?}, expected {expected:?}");
        }
        Ok(order.len() as u64)
    }
}

async fn publish(client: &Client, topic: TopicId, timestamps: &[u64]) -> Result<()> {
    for &timestamp in timestamps {
        client
            .send_stream_data(topic, timestamped(timestamp, b"tick"))
            .await?;
    }
    Ok(())
}

/// A peer presenting the wrong secret never becomes a link
pub struct RejectedHandshake;

#[async_trait]
impl TestScenario for RejectedHandshake {
    fn name(&self) -> &str {
        "rejected_handshake"
    }

    fn description(&self) -> &str {
        "Connections with a bad secret are refused"
    }

    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64> {
        let secured = mesh.switch("secured");
        let listener = TcpLinkServer::bind(
            "127.0.0.1:0",
            secured.clone(),
            ServerOptions {
                auth: Some("letmein".to_string()),
                ..ServerOptions::default()
            },
        )
        .await?;
        let address = listener.local_addr()?.to_string();
        mesh.spawn(async move {
            let _ = listener.run().await;
        });

        let options = ConnectOptions {
            auth: Some("wrong".to_string()),
            ..ConnectOptions::default()
        };
        let outcome = connect_tcp(&address, &options).await;
        ensure!(outcome.is_err(), "handshake with a bad secret succeeded");

        let options = ConnectOptions {
            auth: Some("letmein".to_string()),
            ..ConnectOptions::default()
        };
        let link = connect_tcp(&address, &options).await?;
        mesh.wait_for_snapshot(&secured, "accepted link", |s| s.links.len() == 1)
            .await?;
        link.close();
        Ok(0)
    }
}
