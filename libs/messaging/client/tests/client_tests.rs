//! Client behaviour against a live in-process switch

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mesh_client::{
    timestamped, Client, ClientError, InTopicSynchronizer, SequentialInTopicSynchronizer,
    TopicEvent,
};
use mesh_network::{Switch, SwitchSnapshot};
use mesh_types::ControlData;
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(2);

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

async fn wait_for_snapshot(switch: &Switch, condition: impl Fn(&SwitchSnapshot) -> bool) {
    within(async {
        loop {
            if condition(&switch.snapshot().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

#[tokio::test]
async fn test_stream_data_reaches_subscriber() {
    let switch = Switch::new();
    let producer = Client::connect(&switch).await.unwrap();
    let consumer = Client::connect(&switch).await.unwrap();

    producer.provide([7]).await.unwrap();
    let mut receiver = consumer.topics_receiver([7], true).await.unwrap();
    within(producer.wait_topic_requested(7)).await.unwrap();

    producer.send_stream_data(7, &b"hello"[..]).await.unwrap();
    let event = within(receiver.recv()).await.unwrap();
    assert_eq!(
        event,
        TopicEvent::Data {
            topic: 7,
            data: bytes::Bytes::from_static(b"hello"),
        }
    );
}

#[tokio::test]
async fn test_subscriptions_are_refcounted() {
    let switch = Switch::new();
    let producer = Client::connect(&switch).await.unwrap();
    let consumer = Client::connect(&switch).await.unwrap();

    producer.provide([3]).await.unwrap();
    consumer.subscribe([3]).await.unwrap();
    consumer.subscribe([3]).await.unwrap();
    within(producer.wait_topic_requested(3)).await.unwrap();

    consumer.unsubscribe([3]).await.unwrap();
    assert_eq!(consumer.in_topics().await, [3].into());

    consumer.unsubscribe([3]).await.unwrap();
    within(producer.wait_topic_released(3)).await.unwrap();
    assert!(consumer.in_topics().await.is_empty());

    // unknown topics are ignored
    consumer.unsubscribe([3, 99]).await.unwrap();
}

#[tokio::test]
async fn test_late_subscriber_learns_pause_state() {
    let switch = Switch::new();
    let producer = Client::connect(&switch).await.unwrap();
    let early = Client::connect(&switch).await.unwrap();
    let late = Client::connect(&switch).await.unwrap();

    let mut out = producer.out_topic(11);
    out.set_registered(true).await.unwrap();
    let mut first = early.topics_receiver([11], true).await.unwrap();
    within(out.wait_requested(true)).await.unwrap();
    assert!(out.is_requested());

    out.set_paused(true).await.unwrap();
    out.set_paused(true).await.unwrap();
    let event = within(first.recv()).await.unwrap();
    assert_eq!(
        event,
        TopicEvent::Control {
            topic: 11,
            control: ControlData::new(true),
        }
    );
    assert_eq!(first.control_data(11), Some(ControlData::new(true)));

    let mut topic = late.in_topic(11);
    topic.set_registered(true).await.unwrap();
    wait_for_snapshot(&switch, |snapshot| {
        snapshot
            .links
            .iter()
            .filter(|link| link.in_topics.contains(&11))
            .count()
            == 2
    })
    .await;

    out.send(&b"frame"[..]).await.unwrap();
    let data = within(topic.recv()).await.unwrap();
    assert_eq!(&data[..], b"frame");
    assert!(topic.is_paused());

    // the duplicate pause was not sent, so the next event is the data
    let event = within(first.recv()).await.unwrap();
    assert!(matches!(event, TopicEvent::Data { topic: 11, .. }));
}

#[tokio::test]
async fn test_in_topic_tracks_provider_cost() {
    let switch = Switch::new();
    let producer = Client::connect(&switch).await.unwrap();
    let consumer = Client::connect(&switch).await.unwrap();

    let mut topic = consumer.in_topic(21);
    assert!(!topic.is_available());

    producer.provide([21]).await.unwrap();
    topic.set_registered(true).await.unwrap();
    within(producer.wait_topic_requested(21)).await.unwrap();
    producer.send_stream_data(21, &b"x"[..]).await.unwrap();
    within(topic.recv()).await.unwrap();

    // each of the four link crossings adds the queue cost of 1
    assert_eq!(topic.cost(), Some(4));
    assert!(topic.is_available());
}

#[tokio::test]
async fn test_dropping_in_topic_unsubscribes() {
    let switch = Switch::new();
    let producer = Client::connect(&switch).await.unwrap();
    let consumer = Client::connect(&switch).await.unwrap();

    producer.provide([5]).await.unwrap();
    let mut topic = consumer.in_topic(5);
    topic.set_registered(true).await.unwrap();
    within(producer.wait_topic_requested(5)).await.unwrap();

    drop(topic);
    within(producer.wait_topic_released(5)).await.unwrap();
}

#[tokio::test]
async fn test_addressed_messages() {
    let switch = Switch::new();
    let server = Client::connect(&switch).await.unwrap();
    let caller = Client::connect(&switch).await.unwrap();

    let address = server.request_address().await.unwrap();
    assert_eq!(server.address(), Some(address));
    assert!(matches!(
        server.request_address().await,
        Err(ClientError::AddressAlreadyAssigned { address: a }) if a == address
    ));

    let port = server.get_free_port();
    let mut receiver = server.address_receiver([address], Some(port));
    wait_for_snapshot(&switch, |snapshot| {
        snapshot.addresses.iter().any(|priced| priced.id == address)
    })
    .await;

    caller.send_to(address, port + 1, &b"ignored"[..]).await.unwrap();
    caller.send_to(address, port, &b"ping"[..]).await.unwrap();
    let message = within(receiver.recv()).await.unwrap();
    assert_eq!(message.address, address);
    assert_eq!(message.port, port);
    assert_eq!(&message.data[..], b"ping");

    server.set_address(None).await.unwrap();
    wait_for_snapshot(&switch, |snapshot| snapshot.addresses.is_empty()).await;
}

#[tokio::test]
async fn test_closed_link_fails_receivers() {
    let switch = Switch::new();
    let client = Client::connect(&switch).await.unwrap();
    let mut receiver = client.topics_receiver([1], true).await.unwrap();

    client.close();
    assert!(matches!(
        within(receiver.recv()).await,
        Err(ClientError::ReceiverClosed)
    ));
    let err = client.send_stream_data(1, &b"late"[..]).await.unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn test_synchronized_topics_interleave_by_timestamp() {
    let switch = Switch::new();
    let first = Client::connect(&switch).await.unwrap();
    let second = Client::connect(&switch).await.unwrap();
    let consumer = Client::connect(&switch).await.unwrap();

    let sync: Arc<dyn InTopicSynchronizer> = Arc::new(SequentialInTopicSynchronizer::new());
    let mut topic_a = consumer.sync_in_topic(1, Arc::clone(&sync));
    let mut topic_b = consumer.sync_in_topic(2, Arc::clone(&sync));

    first.provide([1]).await.unwrap();
    second.provide([2]).await.unwrap();
    topic_a.set_registered(true).await.unwrap();
    topic_b.set_registered(true).await.unwrap();
    within(first.wait_topic_requested(1)).await.unwrap();
    within(second.wait_topic_requested(2)).await.unwrap();

    let released = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for mut topic in [topic_a, topic_b] {
        let released = Arc::clone(&released);
        tasks.push(tokio::spawn(async move {
            while let Ok((timestamp, _)) = topic.recv().await {
                released.lock().push((topic.topic(), timestamp));
            }
        }));
    }

    for timestamp in [10, 11, 30] {
        first
            .send_stream_data(1, timestamped(timestamp, b"a"))
            .await
            .unwrap();
    }
    for timestamp in [12, 20] {
        second
            .send_stream_data(2, timestamped(timestamp, b"b"))
            .await
            .unwrap();
    }
    // without a pause, topic 1 at 30 would wait for topic 2 forever
    second
        .send_stream_control(2, ControlData::new(true))
        .await
        .unwrap();

    within(async {
        while released.lock().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    for task in tasks {
        task.abort();
    }

    assert_eq!(
        *released.lock(),
        vec![(1, 10), (1, 11), (2, 12), (2, 20), (1, 30)]
    );
}
