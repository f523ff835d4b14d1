//! Proxy metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or a target.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Proxy metrics collector; also the session id allocator.
pub struct ProxyMetrics {
    /// Proxy start time
    start_time: Instant,
    /// Next session id
    next_session_id: AtomicU32,
    /// Total sessions accepted
    total_sessions: AtomicU64,
    /// Currently active sessions
    active_sessions: AtomicU64,
    /// Sessions that completed negotiation up to a CONNECT target
    negotiated_sessions: AtomicU64,
    /// Sessions dropped for SOCKS protocol violations
    rejected_handshakes: AtomicU64,
    /// Bytes pumped from clients toward remotes
    bytes_to_remote: AtomicU64,
    /// Bytes pumped from remotes toward clients
    bytes_to_client: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            next_session_id: AtomicU32::new(1),
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            negotiated_sessions: AtomicU64::new(0),
            rejected_handshakes: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        }
    }

    /// Allocate the id for a freshly accepted session.
    pub fn allocate_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Count a session in (total and active).
    pub fn increment_sessions(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a session out.
    pub fn decrement_sessions(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a completed negotiation.
    pub fn increment_negotiated(&self) {
        self.negotiated_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a protocol reject.
    pub fn increment_rejected(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Account bytes relayed toward the remote.
    pub fn add_bytes_to_remote(&self, n: u64) {
        self.bytes_to_remote.fetch_add(n, Ordering::Relaxed);
    }

    /// Account bytes relayed toward the client.
    pub fn add_bytes_to_client(&self, n: u64) {
        self.bytes_to_client.fetch_add(n, Ordering::Relaxed);
    }

    /// Sessions that completed negotiation.
    pub fn negotiated_sessions(&self) -> u64 {
        self.negotiated_sessions.load(Ordering::Relaxed)
    }

    /// Currently active sessions.
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Time since the proxy started.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Aggregate snapshot for logging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.uptime(),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            negotiated_sessions: self.negotiated_sessions.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics, safe to log.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Time since the proxy started
    pub uptime: Duration,
    /// Total sessions accepted
    pub total_sessions: u64,
    /// Currently active sessions
    pub active_sessions: u64,
    /// Sessions that reached a CONNECT target
    pub negotiated_sessions: u64,
    /// Sessions dropped for protocol violations
    pub rejected_handshakes: u64,
    /// Bytes relayed toward remotes
    pub bytes_to_remote: u64,
    /// Bytes relayed toward clients
    pub bytes_to_client: u64,
}
