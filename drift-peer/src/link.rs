//! Transport links for peer sessions.
//!
//! A [`Link`] is the outbound half of one peer's transport: the session's
//! writer task pushes encoded lines through it. TCP gets a dedicated
//! stream per peer; UDP peers share one socket and differ only in their
//! destination address. [`MockLink`] captures lines for tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Outbound transport for one peer session.
#[async_trait]
pub trait Link: Send + Sync {
    /// Transmit one already-encoded message line. The newline terminator
    /// is appended here.
    async fn send_line(&self, line: &str) -> io::Result<()>;

    /// Whether this link is datagram-based (no delivery guarantee, so
    /// requests need application-level retry).
    fn is_datagram(&self) -> bool {
        false
    }

    /// Tear down the underlying transport, if this link owns one.
    async fn shutdown(&self);
}

/// Newline-framed stream link over one TCP connection.
pub struct TcpLink {
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpLink {
    /// Wrap the write half of an established connection.
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Datagram link over the node's shared UDP socket.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    max_payload: usize,
}

impl UdpLink {
    /// Address messages through `socket` to one peer.
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr, max_payload: usize) -> Self {
        Self {
            socket,
            target,
            max_payload,
        }
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send_line(&self, line: &str) -> io::Result<()> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        if payload.len() > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "datagram of {} bytes exceeds max payload {}",
                    payload.len(),
                    self.max_payload
                ),
            ));
        }
        self.socket.send_to(&payload, self.target).await.map(|_| ())
    }

    fn is_datagram(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        // The socket is shared with every other UDP peer; nothing to close.
    }
}

/// Test link: captures sent lines on a channel instead of a socket.
pub struct MockLink {
    sent: mpsc::UnboundedSender<String>,
    datagram: bool,
}

impl MockLink {
    /// A stream-like mock and the receiving end of everything sent on it.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::with_datagram(false)
    }

    /// A datagram-like mock (sessions spawn retry timers for these).
    pub fn with_datagram(datagram: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent: tx,
                datagram,
            }),
            rx,
        )
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send_line(&self, line: &str) -> io::Result<()> {
        self.sent
            .send(line.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock receiver dropped"))
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_link_captures_lines() {
        let (link, mut rx) = MockLink::new();
        link.send_line("one").await.unwrap();
        link.send_line("two").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn udp_link_rejects_oversized_payload() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let target = socket.local_addr().unwrap();
        let link = UdpLink::new(socket, target, 16);

        let err = link.send_line(&"x".repeat(64)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        link.send_line("short").await.unwrap();
    }
}
