//! Userspace TCP stack
//!
//! Wraps a smoltcp Interface + SocketSet over the virtual device. The
//! engine never spins its own clock; the host boundary drives `poll(now)`.
//! Any-IP mode lets listening sockets accept flows addressed to arbitrary
//! destinations, which is how interception works: each new TCP flow gets a
//! socket listening on the flow's original destination endpoint.

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State as TcpState};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use crate::device::VirtualTunDevice;
use crate::error::{PassageError, Result};

/// Per-socket receive buffer, capped to respect the engine memory ceiling
pub const TCP_RX_BUFFER_SIZE: usize = 65536;
/// Per-socket send buffer
pub const TCP_TX_BUFFER_SIZE: usize = 65536;

/// Wall-clock time as a smoltcp Instant
pub fn smoltcp_now() -> Instant {
    let duration = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Instant::from_millis(duration.as_millis() as i64)
}

fn to_smoltcp_ip(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a.into()),
        IpAddr::V6(a) => IpAddress::Ipv6(a.into()),
    }
}

/// smoltcp interface, socket set and device under one roof
pub struct StackManager {
    device: VirtualTunDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
}

impl StackManager {
    pub fn new(queue_capacity: usize, mtu: usize, ipv6_enabled: bool) -> Self {
        let mut device = VirtualTunDevice::with_capacity(queue_capacity).with_mtu(mtu);

        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, smoltcp_now());

        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::v4(10, 0, 0, 1), 24));
            if ipv6_enabled {
                let _ = addrs.push(IpCidr::new(IpAddress::v6(0xfd00, 0, 0, 0, 0, 0, 0, 1), 64));
            }
        });
        // accept segments addressed to any destination, not just our own
        iface.set_any_ip(true);

        Self {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
        }
    }

    /// Queue a raw packet from the platform. False means drop-tail hit.
    pub fn push_rx(&mut self, packet: Vec<u8>) -> bool {
        self.device.push_rx(packet)
    }

    /// Queue a synthesized packet straight onto the platform-bound queue.
    pub fn push_tx(&mut self, packet: Vec<u8>) -> bool {
        self.device.push_tx(packet)
    }

    /// Drain everything waiting for the platform.
    pub fn pop_tx_batch(&mut self) -> Vec<Vec<u8>> {
        self.device.pop_tx_batch()
    }

    /// Discard anything still waiting for the stack. Used by shutdown.
    pub fn clear_rx(&mut self) {
        let _ = self.device.pop_rx_batch();
    }

    pub fn rx_dropped(&self) -> u64 {
        self.device.rx_dropped()
    }

    pub fn tx_dropped(&self) -> u64 {
        self.device.tx_dropped()
    }

    /// Advance the stack. Returns true when socket state may have changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        self.iface.poll(now, &mut self.device, &mut self.sockets)
    }

    /// Create a TCP socket listening on the intercepted flow's destination.
    pub fn create_listening_socket(&mut self, dst: SocketAddr) -> Result<SocketHandle> {
        let rx_buffer = TcpSocketBuffer::new(vec![0u8; TCP_RX_BUFFER_SIZE]);
        let tx_buffer = TcpSocketBuffer::new(vec![0u8; TCP_TX_BUFFER_SIZE]);
        let mut socket = TcpSocket::new(rx_buffer, tx_buffer);

        let endpoint = IpListenEndpoint {
            addr: Some(to_smoltcp_ip(dst.ip())),
            port: dst.port(),
        };
        socket
            .listen(endpoint)
            .map_err(|e| PassageError::IoError(format!("listen on {}: {:?}", dst, e)))?;

        Ok(self.sockets.add(socket))
    }

    pub fn socket(&self, handle: SocketHandle) -> &TcpSocket<'static> {
        self.sockets.get::<TcpSocket>(handle)
    }

    pub fn socket_mut(&mut self, handle: SocketHandle) -> &mut TcpSocket<'static> {
        self.sockets.get_mut::<TcpSocket>(handle)
    }

    /// Abort the connection; smoltcp emits a RST on the next poll.
    pub fn abort_socket(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).abort();
    }

    /// Begin a graceful close (FIN) toward the client.
    pub fn close_socket(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).close();
    }

    pub fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.iter().count()
    }

    pub fn socket_state(&self, handle: SocketHandle) -> TcpState {
        self.sockets.get::<TcpSocket>(handle).state()
    }
}
