//! Virtual TUN device for smoltcp
//!
//! Two bounded FIFOs sit between the platform boundary and the stack:
//! rx (platform -> stack) and tx (stack -> platform). Overflow policy is
//! drop-tail with a counter.

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum Transmission Unit
pub const MTU: usize = 1500;

/// Default capacity of each packet queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub struct BoundedQueue {
    packets: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped: u64,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, packet: Vec<u8>) -> bool {
        if self.packets.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.packets.push_back(packet);
        true
    }
}

/// Shared handle to a bounded packet queue
pub type PacketQueue = Arc<Mutex<BoundedQueue>>;

/// Virtual TUN device that interfaces with smoltcp
pub struct VirtualTunDevice {
    rx_queue: PacketQueue,
    tx_queue: PacketQueue,
    mtu: usize,
}

impl VirtualTunDevice {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(BoundedQueue::new(capacity))),
            tx_queue: Arc::new(Mutex::new(BoundedQueue::new(capacity))),
            mtu: MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Enqueue a packet arriving from the platform. Returns false when the
    /// queue was full and the packet was dropped.
    pub fn push_rx(&self, packet: Vec<u8>) -> bool {
        match self.rx_queue.lock() {
            Ok(mut queue) => queue.push(packet),
            Err(_) => false,
        }
    }

    /// Enqueue a packet destined for the platform.
    pub fn push_tx(&self, packet: Vec<u8>) -> bool {
        match self.tx_queue.lock() {
            Ok(mut queue) => queue.push(packet),
            Err(_) => false,
        }
    }

    /// Drain every queued platform-bound packet.
    pub fn pop_tx_batch(&self) -> Vec<Vec<u8>> {
        match self.tx_queue.lock() {
            Ok(mut queue) => queue.packets.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drain every packet waiting for the stack. The stack normally consumes
    /// rx through the smoltcp Device impl; this exists for shutdown.
    pub fn pop_rx_batch(&self) -> Vec<Vec<u8>> {
        match self.rx_queue.lock() {
            Ok(mut queue) => queue.packets.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn has_rx_packets(&self) -> bool {
        self.rx_queue
            .lock()
            .map(|q| !q.packets.is_empty())
            .unwrap_or(false)
    }

    pub fn pending_tx_count(&self) -> usize {
        self.tx_queue.lock().map(|q| q.packets.len()).unwrap_or(0)
    }

    /// Packets lost to rx drop-tail so far.
    pub fn rx_dropped(&self) -> u64 {
        self.rx_queue.lock().map(|q| q.dropped).unwrap_or(0)
    }

    /// Packets lost to tx drop-tail so far.
    pub fn tx_dropped(&self) -> u64 {
        self.tx_queue.lock().map(|q| q.dropped).unwrap_or(0)
    }
}

impl Default for VirtualTunDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for VirtualTunDevice {
    type RxToken<'a> = VirtualRxToken where Self: 'a;
    type TxToken<'a> = VirtualTxToken where Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_queue.lock().ok()?.packets.pop_front()?;

        Some((
            VirtualRxToken { packet },
            VirtualTxToken {
                queue: Arc::clone(&self.tx_queue),
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken {
            queue: Arc::clone(&self.tx_queue),
        })
    }
}

pub struct VirtualRxToken {
    packet: Vec<u8>,
}

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.packet;
        f(&mut packet)
    }
}

pub struct VirtualTxToken {
    queue: PacketQueue,
}

impl TxToken for VirtualTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);

        if let Ok(mut queue) = self.queue.lock() {
            queue.push(buffer);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_creation() {
        let device = VirtualTunDevice::new();
        assert_eq!(device.mtu, MTU);
        assert!(!device.has_rx_packets());
        assert_eq!(device.pending_tx_count(), 0);
    }

    #[test]
    fn test_push_and_drain() {
        let device = VirtualTunDevice::new();
        assert!(device.push_rx(vec![1, 2, 3]));
        assert!(device.has_rx_packets());

        assert!(device.push_tx(vec![4, 5]));
        let batch = device.pop_tx_batch();
        assert_eq!(batch, vec![vec![4, 5]]);
        assert_eq!(device.pending_tx_count(), 0);
    }

    #[test]
    fn test_drop_tail_on_overflow() {
        let device = VirtualTunDevice::with_capacity(2);
        assert!(device.push_rx(vec![1]));
        assert!(device.push_rx(vec![2]));
        assert!(!device.push_rx(vec![3]));
        assert_eq!(device.rx_dropped(), 1);

        // Queue content unchanged by the dropped push
        let batch = device.pop_rx_batch();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_tx_drop_counter_independent() {
        let device = VirtualTunDevice::with_capacity(1);
        assert!(device.push_tx(vec![1]));
        assert!(!device.push_tx(vec![2]));
        assert_eq!(device.tx_dropped(), 1);
        assert_eq!(device.rx_dropped(), 0);
    }

    #[test]
    fn test_capabilities() {
        let device = VirtualTunDevice::new();
        let caps = device.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, MTU);
    }

    #[test]
    fn test_custom_mtu() {
        let device = VirtualTunDevice::new().with_mtu(9000);
        assert_eq!(device.mtu, 9000);
    }
}
