//! End-to-end: retained-history eviction, batched produce acks, and
//! heartbeat-driven eviction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker::tcp::TcpServer;
use mq_engine::{Config, Engine};
use mq_protocol::{Ack, CMESSAGE, CMessage, LinkKind, MESSAGE_RESP, MessageResponse, PMessage};
use mq_test_utils::TestClient;
use tokio::sync::watch;
use tokio::time::timeout;

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

fn pm(topic: &str, value: &str) -> PMessage {
    PMessage {
        topic: topic.as_bytes().to_vec(),
        key: Vec::new(),
        value: value.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn ring_keeps_the_newest_messages_and_offsets_survive_eviction() {
    let (engine, addr, _shutdown) = start_broker(Config {
        buffer_size: 3,
        ..Config::default()
    })
    .await;

    // Five publishes before any consumer exists.
    for i in 1..=5 {
        engine.publisher(pm("t", &format!("v{i}")));
    }
    let topic = engine.get_topic(b"t");
    assert_eq!(topic.history_offsets(), vec![3, 4, 5]);
    assert_eq!(engine.get_topic_offset("t"), 5);

    // A consumer registering now starts from the next publish; the retained
    // history is not replayed.
    let mut consumer = TestClient::connect(addr).await.unwrap();
    consumer
        .register(LinkKind::Consumer, &["t"], Ack::NoConfirm, "")
        .await
        .unwrap();
    // Give the subscription a moment to attach before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.publisher(pm("t", "v6")), 6);

    let frame = timeout(Duration::from_secs(2), consumer.recv_frame())
        .await
        .expect("timed out waiting for offset 6")
        .unwrap();
    assert_eq!(frame.frame_type, CMESSAGE);
    let cm = CMessage::parse(&frame.data).unwrap();
    assert_eq!(cm.offset, 6);
    assert_eq!(cm.pm.value, b"v6");
}

#[tokio::test]
async fn batched_produce_is_acked_with_the_last_offset() {
    let (engine, addr, _shutdown) = start_broker(Config::default()).await;

    let mut producer = TestClient::connect(addr).await.unwrap();
    producer
        .register(LinkKind::Producer, &[], Ack::RespConfirm, "")
        .await
        .unwrap();

    // One frame, two concatenated bodies.
    producer
        .produce(&[pm("t", "v1"), pm("t", "v2")])
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), producer.recv_frame())
        .await
        .expect("timed out waiting for the produce ack")
        .unwrap();
    assert_eq!(frame.frame_type, MESSAGE_RESP);
    let resp = MessageResponse::parse(&frame.data).unwrap();
    assert!(resp.result);
    assert_eq!(resp.offset, 2);
    assert_eq!(engine.get_topic_offset("t"), 2);
}

#[tokio::test]
async fn silent_consumer_is_evicted_by_the_monitor() {
    let (engine, addr, _shutdown) = start_broker(Config {
        heartbeat_timeout: Duration::from_secs(1),
        ..Config::default()
    })
    .await;
    let (_monitor_shutdown, monitor_shutdown_rx) = watch::channel(false);
    let _monitor = engine.start_monitor(monitor_shutdown_rx);

    let mut consumer = TestClient::connect(addr).await.unwrap();
    consumer
        .register(LinkKind::Consumer, &["t"], Ack::NoConfirm, "")
        .await
        .unwrap();
    let consumer_addr = consumer.local_addr().to_string();
    assert!(engine.query_consumer(&consumer_addr).is_some());

    // No heartbeats: the monitor closes the connection and the slot frees.
    let eof = timeout(Duration::from_secs(5), consumer.recv_frame()).await;
    assert!(matches!(eof, Ok(Err(_))), "expected EOF after eviction");

    timeout(Duration::from_secs(2), async {
        while engine.query_consumer(&consumer_addr).is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("slot was not released after eviction");

    // Later publishes are not delivered to the evicted address.
    assert_eq!(engine.get_topic(b"t").consumer_count(), 0);
}

#[tokio::test]
async fn heartbeats_keep_a_quiet_consumer_alive() {
    let (engine, addr, _shutdown) = start_broker(Config {
        heartbeat_timeout: Duration::from_secs(1),
        ..Config::default()
    })
    .await;
    let (_monitor_shutdown, monitor_shutdown_rx) = watch::channel(false);
    let _monitor = engine.start_monitor(monitor_shutdown_rx);

    let mut consumer = TestClient::connect(addr).await.unwrap();
    consumer
        .register(LinkKind::Consumer, &["t"], Ack::NoConfirm, "")
        .await
        .unwrap();
    let consumer_addr = consumer.local_addr().to_string();

    // Heartbeat faster than the timeout for a few periods.
    for _ in 0..6 {
        consumer.heartbeat().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert!(engine.query_consumer(&consumer_addr).is_some());
}
