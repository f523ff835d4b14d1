//! Reference-counted packet-buffer chains.
//!
//! The stack represents a packet as a chain of fixed-size segments drawn
//! from a bounded pool, the way embedded stacks carve packets out of pbuf
//! pools. A chain is cheap to clone — clones share the segment storage and
//! the pool reservation — and the reservation returns to the pool when the
//! last clone is dropped. Anything that holds a chain across an async write
//! clones it first and drops the clone when the write completes.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Size of one pool segment.
pub const SEGMENT_SIZE: usize = 512;

struct PoolInner {
    capacity: usize,
    in_use: AtomicUsize,
}

impl PoolInner {
    fn try_reserve(&self, segments: usize) -> bool {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current + segments > self.capacity {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + segments,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, segments: usize) {
        self.in_use.fetch_sub(segments, Ordering::AcqRel);
    }
}

/// Releases the pool reservation when the last chain clone drops.
struct PoolTicket {
    pool: Arc<PoolInner>,
    segments: usize,
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        self.pool.release(self.segments);
    }
}

/// Bounded allocator for packet-buffer chains.
#[derive(Clone)]
pub struct PbufPool {
    inner: Arc<PoolInner>,
}

impl PbufPool {
    /// Create a pool holding at most `capacity` segments.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Segments currently available.
    pub fn available_segments(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.in_use.load(Ordering::Acquire))
    }

    /// Bytes currently allocatable without exhausting the pool.
    pub fn available_bytes(&self) -> usize {
        self.available_segments() * SEGMENT_SIZE
    }

    /// Allocate a chain of exactly `data.len()` bytes, copying `data` into
    /// it segment by segment. Returns `None` when the pool is exhausted; the
    /// caller decides whether that drops a packet or applies backpressure.
    pub fn alloc_copy(&self, data: &[u8]) -> Option<PacketChain> {
        let segments = data.len().div_ceil(SEGMENT_SIZE).max(1);
        if !self.inner.try_reserve(segments) {
            return None;
        }

        let mut segs = Vec::with_capacity(segments);
        let mut rest = data;
        loop {
            let take = rest.len().min(SEGMENT_SIZE);
            let (seg, tail) = rest.split_at(take);
            segs.push(Bytes::copy_from_slice(seg));
            rest = tail;
            if rest.is_empty() {
                break;
            }
        }

        Some(PacketChain {
            segments: segs,
            len: data.len(),
            ticket: Arc::new(PoolTicket {
                pool: Arc::clone(&self.inner),
                segments,
            }),
        })
    }
}

/// A chained, reference-counted packet buffer.
///
/// Consumers must respect the chain structure: iterate [`segments`] or use
/// [`io_slices`] for gather I/O, never assume the bytes are contiguous.
///
/// [`segments`]: PacketChain::segments
/// [`io_slices`]: PacketChain::io_slices
#[derive(Clone)]
pub struct PacketChain {
    segments: Vec<Bytes>,
    len: usize,
    ticket: Arc<PoolTicket>,
}

impl PacketChain {
    /// Total payload length across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the chain carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of links in the chain.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate the chain links in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| s.as_ref())
    }

    /// Gather list of `(payload, len)` pairs for vectored writes.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments.iter().map(|s| IoSlice::new(s)).collect()
    }

    /// Copy the chain into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }
}

impl std::fmt::Debug for PacketChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketChain")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}
