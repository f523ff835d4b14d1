//! The embedded TCP/IP stack and the surface the proxy drives it through.
//!
//! The stack itself is smoltcp; everything here exists to present it to the
//! rest of the process as a connection-oriented callback surface:
//!
//! - [`StackHandle`] issues per-connection operations — connect, write,
//!   receive-window advance, close, abort — as commands to the driver task.
//! - [`TcpEvent`] delivers the per-connection callbacks — connected, sent,
//!   received data, peer closed, error — over each connection's event
//!   channel.
//! - [`PacketChain`] / [`PbufPool`] carry packet payloads as bounded,
//!   reference-counted scatter-gather chains.
//!
//! All smoltcp entry points and all TUN I/O happen on the driver task
//! ([`StackDriver::run`]); the command/event channels are the only way in
//! or out. A connection exists in the driver's table from `connect` until
//! exactly one terminal transition: a `close` or `abort` command, or a
//! driver-side error event. After that no further events are delivered.

mod device;
mod driver;
mod pbuf;

pub use driver::StackDriver;
pub use pbuf::{PacketChain, PbufPool, SEGMENT_SIZE};

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Identifies one stack connection; the proxy reuses the session id.
pub type ConnId = u32;

/// Capacity of each per-connection event channel.
pub(crate) const EVENT_QUEUE: usize = 256;

/// Capacity of the driver command channel.
pub(crate) const CMD_QUEUE: usize = 256;

/// Commands sessions send to the stack driver.
#[derive(Debug)]
pub(crate) enum StackCmd {
    /// Open a connection and begin delivering its events.
    Connect {
        id: ConnId,
        addr: Ipv4Addr,
        port: u16,
        events: mpsc::Sender<TcpEvent>,
    },
    /// Queue bytes toward the remote. The driver copies them into the
    /// stack's send buffer; the caller's buffer is free on return.
    Write { id: ConnId, data: Bytes },
    /// The client consumed `len` bytes of remote data; advance the
    /// stack's receive window by that much.
    Recved { id: ConnId, len: usize },
    /// Graceful close (FIN). Detaches the connection: no further events.
    Close { id: ConnId },
    /// Hard abort (RST). Detaches the connection: no further events.
    Abort { id: ConnId },
}

/// Per-connection events the stack driver delivers to its session.
#[derive(Debug)]
pub enum TcpEvent {
    /// The three-way handshake completed; `sndbuf` is the send-buffer
    /// space available for writes.
    Connected {
        /// Initial send window in bytes.
        sndbuf: usize,
    },
    /// The remote acknowledged this many bytes; send-buffer space grew.
    Sent(usize),
    /// Remote data arrived. The receiver owns the chain and must report
    /// the consumed length back via `recved` once it is written out.
    Recv(PacketChain),
    /// The remote closed its sending side.
    PeerClosed,
    /// The connection failed; it is already gone on the stack side and
    /// must not be closed or aborted again.
    Error(String),
}

/// Cloneable endpoint for driving the embedded stack.
#[derive(Clone)]
pub struct StackHandle {
    cmd_tx: mpsc::Sender<StackCmd>,
}

impl StackHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<StackCmd>) -> Self {
        Self { cmd_tx }
    }

    async fn send(&self, cmd: StackCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::DriverGone)
    }

    /// Open a connection to `addr:port`; events arrive on `events`.
    pub async fn connect(
        &self,
        id: ConnId,
        addr: Ipv4Addr,
        port: u16,
        events: mpsc::Sender<TcpEvent>,
    ) -> Result<()> {
        self.send(StackCmd::Connect {
            id,
            addr,
            port,
            events,
        })
        .await
    }

    /// Queue bytes toward the remote (copy semantics).
    pub async fn write(&self, id: ConnId, data: Bytes) -> Result<()> {
        self.send(StackCmd::Write { id, data }).await
    }

    /// Advance the connection's receive window by `len` consumed bytes.
    pub async fn recved(&self, id: ConnId, len: usize) -> Result<()> {
        self.send(StackCmd::Recved { id, len }).await
    }

    /// Gracefully close the connection.
    pub async fn close(&self, id: ConnId) -> Result<()> {
        self.send(StackCmd::Close { id }).await
    }

    /// Abort the connection with a reset.
    pub async fn abort(&self, id: ConnId) -> Result<()> {
        self.send(StackCmd::Abort { id }).await
    }
}
