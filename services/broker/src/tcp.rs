//! The broker's TCP transport.
//!
//! One reader task and one writer task per accepted connection.  The reader
//! feeds a [`FrameScanner`] and hands every complete frame to
//! `Engine::on_received`; frames on one connection are therefore processed
//! serially.  The writer drains the connection's queue and performs
//! write+flush, so all outbound traffic for a connection — replies and
//! fan-out alike — is serialized in enqueue order.
//!
//! The engine closes connections (monitor eviction) by address through the
//! close channel wired up in [`TcpServer::bind`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mq_engine::{ConnHandle, Engine};
use mq_protocol::FrameScanner;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

type ConnRegistry = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

pub struct TcpServer {
    listener: TcpListener,
    engine: Arc<Engine>,
    conns: ConnRegistry,
    close_rx: mpsc::UnboundedReceiver<String>,
}

impl TcpServer {
    /// Bind the broker listener and wire the engine's close channel.
    pub async fn bind(addr: &str, engine: Arc<Engine>) -> Result<TcpServer, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        engine.set_close_requester(close_tx);
        Ok(TcpServer {
            listener,
            engine,
            conns: Arc::new(Mutex::new(HashMap::new())),
            close_rx,
        })
    }

    /// Return the bound listen address (useful when port 0 was used).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Accept loop.  Runs until `shutdown` flips to true, then closes every
    /// live connection and returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.start_conn(stream, peer),
                    Err(err) => warn!(%err, "accept failed"),
                },
                requested = self.close_rx.recv() => {
                    let Some(addr) = requested else { break };
                    let close = self.conns.lock().unwrap().get(&addr).cloned();
                    match close {
                        Some(close) => close.notify_one(),
                        None => debug!(addr = %addr, "close requested for unknown connection"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Stop accepting and tear down every live connection.
        let live: Vec<Arc<Notify>> = self.conns.lock().unwrap().values().cloned().collect();
        for close in live {
            close.notify_one();
        }
        info!("tcp transport stopped");
    }

    fn start_conn(&self, stream: TcpStream, peer: SocketAddr) {
        let addr = peer.to_string();
        debug!(addr = %addr, "connection accepted");
        let (conn, out_rx) = ConnHandle::new(addr.clone());
        let close = Arc::new(Notify::new());
        self.conns.lock().unwrap().insert(addr, close.clone());
        self.engine.on_connected(conn.addr());
        tokio::spawn(serve_conn(
            stream,
            conn,
            out_rx,
            close,
            self.engine.clone(),
            self.conns.clone(),
        ));
    }
}

/// Drive one connection until EOF, a read error, or a close request.
async fn serve_conn(
    stream: TcpStream,
    conn: ConnHandle,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    close: Arc<Notify>,
    engine: Arc<Engine>,
    conns: ConnRegistry,
) {
    let addr = conn.addr().to_owned();
    let (mut reader, mut writer) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut scanner = FrameScanner::new();
    let mut buf = vec![0u8; 4096];
    'conn: loop {
        tokio::select! {
            _ = close.notified() => break 'conn,
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'conn,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(addr = %addr, %err, "read failed");
                        break 'conn;
                    }
                };
                scanner.feed(&buf[..n]);
                loop {
                    match scanner.next_frame() {
                        Ok(Some(frame)) => engine.on_received(frame, conn.clone()).await,
                        Ok(None) => break,
                        Err(err) => engine.on_frame_parse_error(&buf[..n], &err),
                    }
                }
            }
        }
    }

    write_task.abort();
    conns.lock().unwrap().remove(&addr);
    engine.on_closed(&addr);
    debug!(addr = %addr, "connection finished");
}
