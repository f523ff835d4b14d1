//! The SOCKS5 server.
//!
//! Accepts client connections on an OS listening socket and gives each one
//! a [`ClientSession`]: the SOCKS5 negotiation up to a CONNECT target,
//! then the bidirectional pump between the OS socket and the session's
//! connection inside the embedded stack.
//!
//! Nothing recovers across session boundaries — a session either completes
//! its pump or dies, and the server just keeps accepting.

mod metrics;
mod pump;
mod session;
pub mod socks5;

pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use session::ClientSession;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpSocket;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::stack::StackHandle;

const LISTEN_BACKLOG: u32 = 128;

/// The accept loop and everything a session needs.
pub struct Server {
    config: Config,
    stack: StackHandle,
    metrics: Arc<ProxyMetrics>,
}

impl Server {
    /// Create a server that opens sessions onto `stack`.
    pub fn new(config: Config, stack: StackHandle) -> Self {
        Self {
            config,
            stack,
            metrics: Arc::new(ProxyMetrics::new()),
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Bind the listener and accept forever.
    ///
    /// Accept errors are logged and do not stop the loop; only failing to
    /// bind is fatal.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen_addr, self.config.listen_port)
            .parse()
            .map_err(|e| Error::config(format!("listen address: {}", e)))?;
        if !addr.is_ipv4() {
            return Err(Error::config("listen address must be IPv4"));
        }

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        tracing::info!("SOCKS5 proxy listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.metrics.allocate_session_id();
                    self.metrics.increment_sessions();
                    tracing::debug!("session {}: accepted connection from {}", id, peer);

                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("session {}: set_nodelay: {}", id, e);
                    }

                    let stack = self.stack.clone();
                    let metrics = Arc::clone(&self.metrics);
                    let buffer_size = self.config.session_buffer;

                    tokio::spawn(async move {
                        let session =
                            ClientSession::new(id, stream, stack, Arc::clone(&metrics), buffer_size);
                        match session.run().await {
                            Ok(()) => {
                                tracing::debug!("session {}: terminated", id);
                            }
                            Err(e) if e.is_protocol_reject() => {
                                metrics.increment_rejected();
                                tracing::debug!("session {}: rejected: {}", id, e);
                            }
                            Err(e) => {
                                tracing::debug!("session {}: error: {}", id, e);
                            }
                        }
                        metrics.decrement_sessions();
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }
}
