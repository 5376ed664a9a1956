// mq-test-utils: a minimal wire-protocol client for broker tests.
//
// Speaks the framed binary protocol over a real TCP socket: register,
// produce, heartbeat, and raw frame send/receive.  Used by the service unit
// tests and the root integration suites; not part of the shipped broker.

use std::net::SocketAddr;

use mq_protocol::{
    Ack, FrameScanner, HEARTBEAT_MESSAGE, LinkKind, MessageResponse, PMESSAGE, PMessage,
    REGISTER_MESSAGE, REGISTER_MESSAGE_RESP, RegisterMessage, TransferFrame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn invalid_data(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

/// A test client holding one broker connection.
pub struct TestClient {
    stream: TcpStream,
    scanner: FrameScanner,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<TestClient> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TestClient {
            stream,
            scanner: FrameScanner::new(),
        })
    }

    /// The address the broker sees this client as.
    pub fn local_addr(&self) -> SocketAddr {
        self.stream
            .local_addr()
            .expect("local_addr always succeeds after connect")
    }

    pub async fn send_frame(&mut self, frame: &TransferFrame) -> std::io::Result<()> {
        let bytes = frame.build().map_err(invalid_data)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// Send raw bytes as-is (for corrupt-stream tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Receive the next complete frame, reading as needed.
    ///
    /// Returns `UnexpectedEof` when the broker closes the connection.
    pub async fn recv_frame(&mut self) -> std::io::Result<TransferFrame> {
        let mut buf = [0u8; 4096];
        loop {
            match self.scanner.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(err) => return Err(invalid_data(err)),
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "broker closed the connection",
                ));
            }
            self.scanner.feed(&buf[..n]);
        }
    }

    /// Register and wait for the broker's response.
    pub async fn register(
        &mut self,
        kind: LinkKind,
        topics: &[&str],
        ack: Ack,
        token: &str,
    ) -> std::io::Result<MessageResponse> {
        let rm = RegisterMessage {
            kind,
            ack,
            topics: topics.iter().map(|t| (*t).to_owned()).collect(),
            token: token.to_owned(),
        };
        let body = rm.build().map_err(invalid_data)?;
        self.send_frame(&TransferFrame::with_data(REGISTER_MESSAGE, body))
            .await?;
        let frame = self.recv_frame().await?;
        if frame.frame_type != REGISTER_MESSAGE_RESP {
            return Err(invalid_data(format!(
                "expected register response, got frame type {}",
                frame.frame_type
            )));
        }
        MessageResponse::parse(&frame.data).map_err(invalid_data)
    }

    /// Send one produce frame carrying the given messages concatenated.
    /// Does not wait for a reply (the producer's ack mode decides whether
    /// one will come).
    pub async fn produce(&mut self, pms: &[PMessage]) -> std::io::Result<()> {
        let mut data = Vec::new();
        for pm in pms {
            pm.build_into(&mut data).map_err(invalid_data)?;
        }
        self.send_frame(&TransferFrame::with_data(PMESSAGE, data))
            .await
    }

    pub async fn heartbeat(&mut self) -> std::io::Result<()> {
        self.send_frame(&TransferFrame::new(HEARTBEAT_MESSAGE)).await
    }
}
