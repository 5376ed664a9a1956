//! End-to-end: HTTP producer edge → engine → TCP consumer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use broker::tcp::TcpServer;
use mq_engine::{Config, Engine};
use mq_protocol::{Ack, CMessage, LinkKind};
use mq_test_utils::TestClient;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::timeout;

async fn start_broker(
    conf: Config,
) -> (Arc<Engine>, SocketAddr, SocketAddr, watch::Sender<bool>) {
    let engine = Arc::new(Engine::new(conf));

    let server = TcpServer::bind("127.0.0.1:0", engine.clone())
        .await
        .expect("failed to bind broker");
    let tcp_addr = server.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind edge");
    let edge_addr = listener.local_addr().unwrap();
    let router = broker::edge::build_router(engine.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("edge server error");
    });
    // Give the edge a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;

    (engine, tcp_addr, edge_addr, shutdown_tx)
}

#[tokio::test]
async fn edge_publish_reaches_a_tcp_consumer() {
    let (_engine, tcp_addr, edge_addr, _shutdown) = start_broker(Config::default()).await;

    let mut consumer = TestClient::connect(tcp_addr).await.unwrap();
    consumer
        .register(LinkKind::Consumer, &["web"], Ack::NoConfirm, "")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("http://{edge_addr}/api/edge/product"))
        .json(&json!({
            "token": "",
            "topic": "web",
            "key": "k",
            "value": BASE64.encode(b"hello"),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "Accepted");
    assert_eq!(resp["offset"], 1);

    let frame = timeout(Duration::from_secs(2), consumer.recv_frame())
        .await
        .expect("timed out waiting for the edge-published message")
        .unwrap();
    let cm = CMessage::parse(&frame.data).unwrap();
    assert_eq!(cm.offset, 1);
    assert_eq!(cm.pm.topic, b"web");
    assert_eq!(cm.pm.value, b"hello");
}

#[tokio::test]
async fn async_edge_endpoint_accepts_and_assigns_offsets() {
    let (engine, _tcp_addr, edge_addr, _shutdown) = start_broker(Config::default()).await;

    let client = reqwest::Client::new();
    for expected_offset in 1..=3 {
        let resp: serde_json::Value = client
            .post(format!("http://{edge_addr}/api/edge/product/async"))
            .json(&json!({
                "topic": "jobs",
                "value": BASE64.encode(b"payload"),
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["status"], "Accepted");
        assert_eq!(resp["offset"], expected_offset);
    }
    assert_eq!(engine.get_topic_offset("jobs"), 3);
}

#[tokio::test]
async fn edge_failure_mapping() {
    let (_engine, _tcp_addr, edge_addr, _shutdown) = start_broker(Config {
        token: "s3cret".to_owned(),
        ..Config::default()
    })
    .await;
    let client = reqwest::Client::new();

    // Bad base64 → UnmarshalFailed.
    let resp: serde_json::Value = client
        .post(format!("http://{edge_addr}/api/edge/product"))
        .json(&json!({"topic": "t", "value": "!!not base64!!"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "UnmarshalFailed");

    // Wrong token → TokenIncorrect.
    let resp: serde_json::Value = client
        .post(format!("http://{edge_addr}/api/edge/product"))
        .json(&json!({"token": "wrong", "topic": "t", "value": BASE64.encode(b"x")}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "TokenIncorrect");

    // Empty topic → Refused.
    let resp: serde_json::Value = client
        .post(format!("http://{edge_addr}/api/edge/product"))
        .json(&json!({"topic": "", "value": BASE64.encode(b"x")}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "Refused");
}
