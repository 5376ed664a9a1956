//! End-to-end: token auth and slot-table capacity over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use broker::tcp::TcpServer;
use mq_engine::{Config, Engine};
use mq_protocol::{Ack, LinkKind, RespStatus};
use mq_test_utils::TestClient;
use tokio::sync::watch;

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

#[tokio::test]
async fn wrong_token_is_rejected_without_binding_a_slot() {
    let (engine, addr, _shutdown) = start_broker(Config {
        token: "s3cret".to_owned(),
        ..Config::default()
    })
    .await;

    let mut client = TestClient::connect(addr).await.unwrap();
    let resp = client
        .register(LinkKind::Producer, &[], Ack::RespConfirm, "nope")
        .await
        .unwrap();
    assert!(!resp.result);
    assert_eq!(resp.status, RespStatus::TokenIncorrect);
    assert!(
        engine
            .query_producer(&client.local_addr().to_string())
            .is_none()
    );

    // The connection stays open: a retry with the right token succeeds.
    let resp = client
        .register(LinkKind::Producer, &[], Ack::RespConfirm, "s3cret")
        .await
        .unwrap();
    assert!(resp.result);
    assert_eq!(resp.status, RespStatus::Accepted);
}

#[tokio::test]
async fn full_producer_table_refuses_the_next_registration() {
    let (engine, addr, _shutdown) = start_broker(Config {
        max_open_conn: 1,
        ..Config::default()
    })
    .await;

    let mut first = TestClient::connect(addr).await.unwrap();
    let resp = first
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(resp.result);

    let mut second = TestClient::connect(addr).await.unwrap();
    let resp = second
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(!resp.result);
    assert_eq!(resp.status, RespStatus::Refused);

    // The first binding is untouched.
    assert!(
        engine
            .query_producer(&first.local_addr().to_string())
            .is_some()
    );
    assert!(
        engine
            .query_producer(&second.local_addr().to_string())
            .is_none()
    );
}

#[tokio::test]
async fn producer_and_consumer_tables_fill_independently() {
    let (_engine, addr, _shutdown) = start_broker(Config {
        max_open_conn: 1,
        ..Config::default()
    })
    .await;

    let mut producer = TestClient::connect(addr).await.unwrap();
    let resp = producer
        .register(LinkKind::Producer, &[], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(resp.result);

    // The producer table being full does not affect the consumer table.
    let mut consumer = TestClient::connect(addr).await.unwrap();
    let resp = consumer
        .register(LinkKind::Consumer, &["t"], Ack::NoConfirm, "")
        .await
        .unwrap();
    assert!(resp.result);
}
