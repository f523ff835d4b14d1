//! Per-client session.
//!
//! One session owns one accepted SOCKS connection from the moment it is
//! accepted until both the OS socket is closed and the stack side has
//! released the connection. It runs the negotiation over its staging
//! buffer, asks the stack driver for an outbound connection, and then
//! hands both to the pump.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::{pump, socks5};
use crate::stack::{ConnId, StackHandle, EVENT_QUEUE};

/// A single SOCKS client connection.
pub struct ClientSession<S> {
    id: ConnId,
    stream: S,
    stack: StackHandle,
    metrics: Arc<ProxyMetrics>,
    /// Staging buffer: negotiation framing first, pump reads later.
    buf: Vec<u8>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for an accepted connection.
    pub fn new(
        id: ConnId,
        stream: S,
        stack: StackHandle,
        metrics: Arc<ProxyMetrics>,
        buffer_size: usize,
    ) -> Self {
        Self {
            id,
            stream,
            stack,
            metrics,
            buf: vec![0u8; buffer_size],
        }
    }

    /// Drive the session to completion.
    ///
    /// Negotiation errors return before any stack connection exists, so
    /// dropping the socket is the whole cleanup; once the pump is running
    /// it releases the stack side itself on every exit path.
    pub async fn run(mut self) -> Result<()> {
        let target = socks5::negotiate(&mut self.stream, &mut self.buf).await?;

        tracing::info!("session {}: CONNECT {}", self.id, target);
        self.metrics.increment_negotiated();

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE);
        self.stack
            .connect(self.id, target.addr, target.port, event_tx)
            .await?;

        pump::run(
            self.stream,
            &mut self.buf,
            self.id,
            &self.stack,
            &mut event_rx,
            &self.metrics,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{StackCmd, TcpEvent};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    /// End-to-end framing through negotiation and pump, against a scripted
    /// driver: `05 01 00`, then CONNECT 127.0.0.1:8080, expect `05 00` and
    /// the fixed ten-byte success reply once the stack connects.
    #[tokio::test]
    async fn test_connect_success_framing() {
        let (mut client, server) = duplex(64 * 1024);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let stack = StackHandle::new(cmd_tx);
        let metrics = Arc::new(ProxyMetrics::new());

        let session = ClientSession::new(7, server, stack, Arc::clone(&metrics), 64 * 1024);
        let task = tokio::spawn(session.run());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();

        // The session asks the stack to connect to the parsed target.
        let events = match timeout(Duration::from_secs(2), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            StackCmd::Connect {
                id,
                addr,
                port,
                events,
            } => {
                assert_eq!(id, 7);
                assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1));
                assert_eq!(port, 8080);
                events
            }
            other => panic!("expected Connect, got {:?}", other),
        };

        events
            .send(TcpEvent::Connected { sndbuf: 65536 })
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        assert_eq!(metrics.negotiated_sessions(), 1);

        // Client hangs up; the session closes the stack side gracefully.
        client.shutdown().await.unwrap();
        assert!(matches!(
            timeout(Duration::from_secs(2), cmd_rx.recv())
                .await
                .unwrap()
                .unwrap(),
            StackCmd::Close { id: 7 }
        ));
        assert!(task.await.unwrap().is_ok());
    }

    /// A failed stack connect produces no SOCKS reply at all; the socket
    /// just closes.
    #[tokio::test]
    async fn test_connect_failure_closes_without_reply() {
        let (mut client, server) = duplex(64 * 1024);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let stack = StackHandle::new(cmd_tx);
        let metrics = Arc::new(ProxyMetrics::new());

        let session = ClientSession::new(8, server, stack, metrics, 64 * 1024);
        let task = tokio::spawn(session.run());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();

        let events = match timeout(Duration::from_secs(2), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            StackCmd::Connect { events, .. } => events,
            other => panic!("expected Connect, got {:?}", other),
        };
        events
            .send(TcpEvent::Error("connection refused".into()))
            .await
            .unwrap();

        assert!(task.await.unwrap().is_err());

        let mut leftover = Vec::new();
        client.read_to_end(&mut leftover).await.unwrap();
        assert!(leftover.is_empty());
    }

    /// A protocol reject never allocates a stack connection.
    #[tokio::test]
    async fn test_protocol_reject_never_touches_stack() {
        let (mut client, server) = duplex(64 * 1024);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let stack = StackHandle::new(cmd_tx);
        let metrics = Arc::new(ProxyMetrics::new());

        let session = ClientSession::new(9, server, stack, metrics, 64 * 1024);
        let task = tokio::spawn(session.run());

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        client.shutdown().await.unwrap();

        let result = task.await.unwrap();
        assert!(result.unwrap_err().is_protocol_reject());
        assert!(cmd_rx.recv().await.is_none());
    }
}
