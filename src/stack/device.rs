//! In-memory packet device backing the embedded stack.
//!
//! The stack does not touch the TUN file descriptor. It reads and writes
//! frames through this queue pair; the driver moves frames between the
//! queues and the TUN device around each poll.

use std::collections::VecDeque;

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;

/// Queue-backed IP-level device for the embedded stack.
pub(crate) struct QueueDevice {
    ingress: VecDeque<Vec<u8>>,
    egress: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl QueueDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            ingress: VecDeque::new(),
            egress: VecDeque::new(),
            mtu,
        }
    }

    /// Queue one inbound IP packet for the next stack poll.
    pub(crate) fn enqueue_ingress(&mut self, frame: Vec<u8>) {
        self.ingress.push_back(frame);
    }

    /// Take the next outbound IP packet emitted by the stack, if any.
    pub(crate) fn dequeue_egress(&mut self) -> Option<Vec<u8>> {
        self.egress.pop_front()
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = RxToken
    where
        Self: 'a;
    type TxToken<'a> = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.ingress.pop_front()?;
        Some((
            RxToken { frame },
            TxToken {
                queue: &mut self.egress,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            queue: &mut self.egress,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

/// One received frame, consumed by the stack.
pub(crate) struct RxToken {
    frame: Vec<u8>,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.frame)
    }
}

/// One transmit slot; the stack fills it and the frame lands on the egress queue.
pub(crate) struct TxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.queue.push_back(frame);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{RxToken as _, TxToken as _};

    #[test]
    fn test_ingress_roundtrip() {
        let mut dev = QueueDevice::new(1500);
        dev.enqueue_ingress(vec![1, 2, 3]);

        let (rx, _tx) = dev.receive(Instant::now()).unwrap();
        let seen = rx.consume(|frame| frame.to_vec());
        assert_eq!(seen, vec![1, 2, 3]);

        assert!(dev.receive(Instant::now()).is_none());
    }

    #[test]
    fn test_egress_queued() {
        let mut dev = QueueDevice::new(1500);

        let tx = dev.transmit(Instant::now()).unwrap();
        tx.consume(4, |frame| frame.copy_from_slice(&[9, 8, 7, 6]));

        assert_eq!(dev.dequeue_egress(), Some(vec![9, 8, 7, 6]));
        assert_eq!(dev.dequeue_egress(), None);
    }

    #[test]
    fn test_capabilities() {
        let dev = QueueDevice::new(1500);
        let caps = dev.capabilities();
        assert_eq!(caps.max_transmission_unit, 1500);
        assert_eq!(caps.medium, Medium::Ip);
    }
}
