//! End-to-end: register → publish → fan-out over real sockets.
//!
//! Covers:
//! - A registered consumer receives a producer's message with offset 1.
//! - Producing without registering earns a re-register frame and publishes
//!   nothing.
//! - Fan-out reaches multiple consumers subscribed to the same topic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker::tcp::TcpServer;
use mq_engine::{Config, Engine};
use mq_protocol::{Ack, CMESSAGE, CMessage, LinkKind, PMessage, RE_REGISTER_MESSAGE};
use mq_test_utils::TestClient;
use tokio::sync::watch;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_broker(conf: Config) -> (Arc<Engine>, SocketAddr, watch::Sender<bool>) {
    let engine = Arc::new(Engine::new(conf));
    let server = TcpServer::bind("127.0.0.1:0", engine.clone())
        .await
        .expect("failed to bind broker");
    let addr = server.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));
    (engine, addr, shutdown_tx)
}

fn pm(topic: &str, key: &str, value: &str) -> PMessage {
    PMessage {
        topic: topic.as_bytes().to_vec(),
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
}

async fn recv_cmessage(client: &mut TestClient) -> CMessage {
    let frame = timeout(Duration::from_secs(2), client.recv_frame())
        .await
        .expect("timed out waiting for a consumer message")
        .expect("connection closed");
    assert_eq!(frame.frame_type, CMESSAGE);
    CMessage::parse(&frame.data).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registered_consumer_receives_publish() {
    let (_engine, addr, _shutdown) = start_broker(Config {
        max_open_conn: 4,
        buffer_size: 8,
        ..Config::default()
    })
    .await;

    let mut consumer = TestClient::connect(addr).await.unwrap();
    let resp = consumer
        .register(LinkKind::Consumer, &["t"], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(resp.result);

    let mut producer = TestClient::connect(addr).await.unwrap();
    let resp = producer
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(resp.result);

    producer.produce(&[pm("t", "k", "v1")]).await.unwrap();

    let cm = recv_cmessage(&mut consumer).await;
    assert_eq!(cm.offset, 1);
    assert_eq!(cm.pm.topic, b"t");
    assert_eq!(cm.pm.key, b"k");
    assert_eq!(cm.pm.value, b"v1");
}

#[tokio::test]
async fn produce_without_register_is_sent_back_to_register() {
    let (engine, addr, _shutdown) = start_broker(Config::default()).await;

    let mut rogue = TestClient::connect(addr).await.unwrap();
    rogue.produce(&[pm("t", "", "x")]).await.unwrap();

    let frame = timeout(Duration::from_secs(2), rogue.recv_frame())
        .await
        .expect("timed out waiting for the broker's answer")
        .unwrap();
    assert_eq!(frame.frame_type, RE_REGISTER_MESSAGE);
    assert!(frame.data.is_empty());
    assert_eq!(engine.get_topic_offset("t"), 0);
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() {
    let (_engine, addr, _shutdown) = start_broker(Config::default()).await;

    let mut first = TestClient::connect(addr).await.unwrap();
    first
        .register(LinkKind::Consumer, &["news"], Ack::NoConfirm, "")
        .await
        .unwrap();
    let mut second = TestClient::connect(addr).await.unwrap();
    second
        .register(LinkKind::Consumer, &["news"], Ack::NoConfirm, "")
        .await
        .unwrap();

    let mut producer = TestClient::connect(addr).await.unwrap();
    producer
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    producer.produce(&[pm("news", "", "breaking")]).await.unwrap();

    for consumer in [&mut first, &mut second] {
        let cm = recv_cmessage(consumer).await;
        assert_eq!(cm.offset, 1);
        assert_eq!(cm.pm.value, b"breaking");
    }
}

#[tokio::test]
async fn consumer_only_sees_its_topics() {
    let (_engine, addr, _shutdown) = start_broker(Config::default()).await;

    let mut consumer = TestClient::connect(addr).await.unwrap();
    consumer
        .register(LinkKind::Consumer, &["a"], Ack::NoConfirm, "")
        .await
        .unwrap();

    let mut producer = TestClient::connect(addr).await.unwrap();
    producer
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    producer.produce(&[pm("b", "", "other")]).await.unwrap();
    producer.produce(&[pm("a", "", "mine")]).await.unwrap();

    // Only the "a" message arrives; "b" went to a topic with no subscribers.
    let cm = recv_cmessage(&mut consumer).await;
    assert_eq!(cm.pm.topic, b"a");
    assert_eq!(cm.pm.value, b"mine");
}
