//! # tunsocks
//!
//! A user-space SOCKS5 proxy that carries its outbound connections over an
//! embedded TCP/IP stack bound to a TUN device. Client connections terminate
//! on ordinary OS sockets; the remote side of every connection lives inside
//! the process, which synthesizes raw IP packets and exchanges them with the
//! kernel through `/dev/net/tun`. Outbound traffic therefore bypasses the
//! host routing policy entirely.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      SOCKS5 clients                       │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ OS TCP sockets (port 8080)
//! ┌───────────────▼──────────────────────────────────────────┐
//! │  Acceptor → ClientSession (negotiation FSM + byte pump)  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Stack driver (smoltcp interface, sockets, 100ms tick)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  TUN shim (packet-buffer chains ⇄ /dev/net/tun)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions never touch the stack directly: every stack entry point runs on
//! the driver task, and sessions talk to it through command/event channels.
//! That keeps the embedded stack effectively single-threaded while each
//! session's pump enforces the flow-control contract — it only reads from
//! the client while the stack has send-buffer space, and it acknowledges
//! remote data back to the stack only after the client write completed.

#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod proxy;
pub mod stack;
pub mod tun;

pub use config::Config;
pub use error::{Error, Result};

/// Interface MTU and the size of a single TUN read.
pub const MTU: usize = 1500;

/// Per-session staging buffer: negotiation framing first, pump reads later.
pub const SESSION_BUFFER_SIZE: usize = 64 * 1024;

/// Stack timer tick period (milliseconds).
pub const STACK_TICK_MS: u64 = 100;
