// broker: the deployable relay-mq broker service.
//
// Wires the engine to its collaborators: the framed-TCP transport, the HTTP
// producer edge, the liveness monitor, and the shutdown signal.

pub mod config;
pub mod edge;
pub mod tcp;

pub use config::{BrokerConfig, ConfigError, load_config_from_path, load_config_from_str};

use std::sync::Arc;

use mq_engine::Engine;
use tokio::sync::watch;
use tracing::info;

/// Run a broker until ctrl-c.
pub async fn run(conf: BrokerConfig) -> Result<(), std::io::Error> {
    let engine = Arc::new(Engine::new(conf.engine_config()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tcp = tcp::TcpServer::bind(&format!("{}:{}", conf.host, conf.port), engine.clone()).await?;
    info!(addr = %tcp.local_addr(), "broker listening");

    let monitor = engine.start_monitor(shutdown_rx.clone());
    let tcp_task = tokio::spawn(tcp.run(shutdown_rx.clone()));

    let edge_task = if conf.edge.enabled {
        let listener = tokio::net::TcpListener::bind(&conf.edge.bind).await?;
        info!(addr = %listener.local_addr()?, "edge listening");
        let router = edge::build_router(engine.clone());
        let mut edge_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = edge_shutdown.changed().await;
            });
            if let Err(err) = serve.await {
                tracing::error!(%err, "edge server error");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tcp_task.await;
    let _ = monitor.await;
    if let Some(edge_task) = edge_task {
        let _ = edge_task.await;
    }
    Ok(())
}
