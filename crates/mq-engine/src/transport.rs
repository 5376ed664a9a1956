//! Contracts between the engine and the transport that feeds it.
//!
//! The transport owns the sockets.  For each accepted connection it hands the
//! engine a [`ConnHandle`]: the address plus the sending side of that
//! connection's write queue.  A single writer task per connection drains the
//! queue and performs the actual write+flush, so all writes on one connection
//! are serialized and a slow consumer head-of-line blocks only itself.

use mq_protocol::{CodecError, TransferFrame};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::engine::EngineError;

/// Frames queued per connection before sends start failing.
pub const CONN_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write queue full for {0}")]
    QueueFull(String),
    #[error("connection {0} is closed")]
    ConnClosed(String),
}

/// Channel on which the engine asks the transport to close an address.
pub type CloseRequester = mpsc::UnboundedSender<String>;

/// Write capability for one live connection.
///
/// Cloneable: the engine stores clones in slots and topic consumer sets.  An
/// enqueue failure is reported but never closes the connection — connection
/// teardown is the transport's job.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    addr: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn new(addr: impl Into<String>) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(CONN_QUEUE_CAPACITY);
        (
            ConnHandle {
                addr: addr.into(),
                tx,
            },
            rx,
        )
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Enqueue one encoded frame for this connection's writer.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(self.addr.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnClosed(self.addr.clone()),
        })
    }
}

/// Host callbacks for broker lifecycle events.  All methods default to no-ops.
pub trait EventHandler: Send + Sync {
    fn on_producer_register(&self, addr: &str) {
        let _ = addr;
    }

    fn on_consumer_register(&self, addr: &str) {
        let _ = addr;
    }

    fn on_producer_closed(&self, addr: &str) {
        let _ = addr;
    }

    fn on_consumer_closed(&self, addr: &str) {
        let _ = addr;
    }

    /// A fan-out batch for `topic` has been handed to the consumer writers.
    fn on_cm_consumed(&self, topic: &[u8], offsets: &[u64]) {
        let _ = (topic, offsets);
    }

    /// The transport failed to extract a frame from `raw`.
    fn on_frame_parse_error(&self, raw: &[u8], err: &CodecError) {
        let _ = (raw, err);
    }

    /// A frame arrived whose type resolves to nothing.  Return `Ok(true)` to
    /// write the (possibly rewritten) frame back to the client.
    fn on_not_implemented(
        &self,
        frame: &mut TransferFrame,
        conn: &ConnHandle,
    ) -> Result<bool, EngineError> {
        let _ = (frame, conn);
        Ok(false)
    }
}

/// The all-no-op handler used when the host installs nothing.
#[derive(Debug, Default)]
pub struct DefaultEventHandler;

impl EventHandler for DefaultEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_writer_queue() {
        let (conn, mut rx) = ConnHandle::new("127.0.0.1:9999");
        conn.send(vec![1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn send_reports_queue_full_without_blocking() {
        let (conn, _rx) = ConnHandle::new("127.0.0.1:9999");
        for _ in 0..CONN_QUEUE_CAPACITY {
            conn.send(vec![0]).unwrap();
        }
        assert!(matches!(
            conn.send(vec![0]),
            Err(TransportError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn send_reports_closed_connection() {
        let (conn, rx) = ConnHandle::new("127.0.0.1:9999");
        drop(rx);
        assert!(matches!(
            conn.send(vec![0]),
            Err(TransportError::ConnClosed(_))
        ));
    }
}
