//! The per-session byte pump.
//!
//! Couples the OS socket facing the SOCKS client with the session's stack
//! connection, subject to both sides' flow control: bytes are only read
//! from the client while the stack has send-buffer space, and remote data
//! is only acknowledged back to the stack once its write to the client
//! completed.
//!
//! The pump is driven by two completion sources — the one in-flight client
//! read and the connection's event stream — merged in a single select loop,
//! so at most one read is ever outstanding and no locking is needed.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::socks5::SUCCESS_REPLY;
use crate::stack::{ConnId, StackHandle, TcpEvent};

/// Relay bytes between `stream` and connection `id` until either side
/// finishes.
///
/// Waits for the stack to report the connection established, answers the
/// client with the fixed success reply, and then pumps both directions.
/// On return the stream is dropped (closing the socket) and the stack side
/// has been released by exactly one of: a close command, an abort command,
/// or a stack-originated error event.
pub(crate) async fn run<S>(
    stream: S,
    buf: &mut [u8],
    id: ConnId,
    stack: &StackHandle,
    events: &mut mpsc::Receiver<TcpEvent>,
    metrics: &ProxyMetrics,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;

    // No reply bytes before the stack reports the handshake done; a failed
    // connect closes the socket with nothing written.
    let mut send_window = match events.recv().await {
        Some(TcpEvent::Connected { sndbuf }) => sndbuf,
        Some(TcpEvent::Error(reason)) => return Err(Error::ConnectionFailed(reason)),
        Some(_) => {
            let _ = stack.abort(id).await;
            return Err(Error::stack("unexpected event before connect completed"));
        }
        None => return Err(Error::DriverGone),
    };

    if let Err(e) = stream.write_all(&SUCCESS_REPLY).await {
        let _ = stack.abort(id).await;
        return Err(Error::Network(e));
    }

    let (mut rd, mut wr) = tokio::io::split(stream);

    loop {
        // Flow control toward the stack: read at most what its send buffer
        // can take, and nothing at all while it is full.
        let budget = buf.len().min(send_window);

        tokio::select! {
            res = rd.read(&mut buf[..budget]), if budget > 0 => match res {
                // Client EOF: graceful close toward the stack, then done.
                Ok(0) => {
                    let _ = stack.close(id).await;
                    return Ok(());
                }
                Ok(len) => {
                    send_window -= len;
                    metrics.add_bytes_to_remote(len as u64);
                    // Copy semantics: the stack owns its own copy of the
                    // bytes, the staging buffer is reusable immediately.
                    stack.write(id, Bytes::copy_from_slice(&buf[..len])).await?;
                }
                Err(e) => {
                    let _ = stack.abort(id).await;
                    return Err(Error::Network(e));
                }
            },
            event = events.recv() => match event {
                // The remote ACKed bytes; the freed send-buffer space
                // re-arms reading after a zero-window stall.
                Some(TcpEvent::Sent(n)) => send_window += n,
                Some(TcpEvent::Recv(chain)) => {
                    let len = chain.len();
                    for seg in chain.segments() {
                        if let Err(e) = wr.write_all(seg).await {
                            let _ = stack.abort(id).await;
                            return Err(Error::Network(e));
                        }
                    }
                    metrics.add_bytes_to_client(len as u64);
                    // Release the chain before advancing the receive
                    // window by exactly the consumed bytes.
                    drop(chain);
                    stack.recved(id, len).await?;
                }
                Some(TcpEvent::PeerClosed) => {
                    let _ = stack.close(id).await;
                    return Ok(());
                }
                // The connection is already gone on the stack side; only
                // the socket is torn down, no close or abort goes back.
                Some(TcpEvent::Error(reason)) => return Err(Error::ConnectionFailed(reason)),
                Some(TcpEvent::Connected { .. }) => {}
                None => return Err(Error::DriverGone),
            },
        }
    }
}
