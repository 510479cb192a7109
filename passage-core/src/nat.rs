//! NAT / flow-tracking table
//!
//! Maps transport 5-tuples to tracked flows and allocates the local ports
//! that bridge the userspace stack to host-side sockets. Entries are owned
//! by the flow manager; this module only tracks identity, state and
//! accounting.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::PassageError;
use crate::packet::{PROTO_TCP, PROTO_UDP};
use crate::proxy::RoutingDecision;

/// First local port handed out
pub const LOCAL_PORT_MIN: u16 = 10000;
/// Last local port handed out
pub const LOCAL_PORT_MAX: u16 = 65535;

/// Flow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created, not yet classified
    New,
    /// Classified, upstream path being established
    Connecting,
    /// Upstream ready, bytes flowing
    Established,
    /// Teardown in progress
    Closing,
    /// Done; reclaimed after linger
    Closed,
}

/// Transport 5-tuple identifying a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// IANA protocol number (6 = TCP, 17 = UDP)
    pub protocol: u8,
}

impl FlowKey {
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src_ip: src.ip(),
            src_port: src.port(),
            dst_ip: dst.ip(),
            dst_port: dst.port(),
            protocol: PROTO_TCP,
        }
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src_ip: src.ip(),
            src_port: src.port(),
            dst_ip: dst.ip(),
            dst_port: dst.port(),
            protocol: PROTO_UDP,
        }
    }

    pub fn src_addr(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }
}

/// A tracked flow
#[derive(Debug, Clone)]
pub struct NatEntry {
    pub key: FlowKey,
    /// Unique among live entries, within [LOCAL_PORT_MIN, LOCAL_PORT_MAX]
    pub local_port: u16,
    pub state: FlowState,
    /// Bytes copied upstream -> client
    pub bytes_in: u64,
    /// Bytes copied client -> upstream
    pub bytes_out: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Set once at classification, immutable afterwards
    route: Option<RoutingDecision>,
    closed_at: Option<Instant>,
}

impl NatEntry {
    fn new(key: FlowKey, local_port: u16, now: Instant) -> Self {
        Self {
            key,
            local_port,
            state: FlowState::New,
            bytes_in: 0,
            bytes_out: 0,
            created_at: now,
            last_activity: now,
            route: None,
            closed_at: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Cache the routing decision. The first write wins; later calls are
    /// ignored so the decision stays immutable for the life of the entry.
    pub fn set_route(&mut self, decision: RoutingDecision) {
        if self.route.is_none() {
            self.route = Some(decision);
        }
    }

    pub fn route(&self) -> Option<&RoutingDecision> {
        self.route.as_ref()
    }

    pub fn set_state(&mut self, state: FlowState, now: Instant) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.last_activity = now;
        if state == FlowState::Closed {
            self.closed_at = Some(now);
        }
    }

    /// True once the entry has sat in Closed for at least `linger`.
    pub fn reclaimable(&self, linger: Duration, now: Instant) -> bool {
        match (self.state, self.closed_at) {
            (FlowState::Closed, Some(at)) => now.duration_since(at) >= linger,
            _ => false,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }
}

/// Flow table with key and local-port indexes
pub struct NatTable {
    entries: HashMap<FlowKey, NatEntry>,
    port_to_key: HashMap<u16, FlowKey>,
    /// Rolling allocation cursor
    next_port: u16,
    max_entries: usize,
}

impl NatTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            port_to_key: HashMap::new(),
            next_port: LOCAL_PORT_MIN,
            max_entries,
        }
    }

    fn allocate_port(&mut self) -> Result<u16, PassageError> {
        let start = self.next_port;
        loop {
            let port = self.next_port;
            self.next_port = if self.next_port >= LOCAL_PORT_MAX {
                LOCAL_PORT_MIN
            } else {
                self.next_port + 1
            };

            if !self.port_to_key.contains_key(&port) {
                return Ok(port);
            }

            if self.next_port == start {
                return Err(PassageError::NatTableFull);
            }
        }
    }

    /// Create a fresh entry for a new flow key.
    ///
    /// Fails with NatTableFull when the table is at capacity or the port
    /// space is exhausted; the caller drops the triggering packet.
    pub fn create(&mut self, key: FlowKey, now: Instant) -> Result<&mut NatEntry, PassageError> {
        if self.entries.contains_key(&key) {
            return Ok(self.entries.get_mut(&key).expect("checked above"));
        }

        if self.entries.len() >= self.max_entries {
            return Err(PassageError::NatTableFull);
        }

        let local_port = self.allocate_port()?;
        let entry = NatEntry::new(key, local_port, now);

        self.port_to_key.insert(local_port, key);
        self.entries.insert(key, entry);

        Ok(self.entries.get_mut(&key).expect("just inserted"))
    }

    pub fn get(&self, key: &FlowKey) -> Option<&NatEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut NatEntry> {
        self.entries.get_mut(key)
    }

    pub fn get_by_port(&self, port: u16) -> Option<&NatEntry> {
        self.port_to_key
            .get(&port)
            .and_then(|key| self.entries.get(key))
    }

    pub fn key_by_port(&self, port: u16) -> Option<&FlowKey> {
        self.port_to_key.get(&port)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<NatEntry> {
        let entry = self.entries.remove(key)?;
        self.port_to_key.remove(&entry.local_port);
        Some(entry)
    }

    pub fn add_bytes_in(&mut self, key: &FlowKey, bytes: u64, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.bytes_in += bytes;
            entry.touch(now);
        }
    }

    pub fn add_bytes_out(&mut self, key: &FlowKey, bytes: u64, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.bytes_out += bytes;
            entry.touch(now);
        }
    }

    /// Reclaim entries that finished their post-Closed linger. Returns the
    /// reclaimed entries so the flow manager can release attached handles.
    pub fn reclaim_lingered(&mut self, linger: Duration, now: Instant) -> Vec<NatEntry> {
        let keys: Vec<FlowKey> = self
            .entries
            .values()
            .filter(|e| e.reclaimable(linger, now))
            .map(|e| e.key)
            .collect();

        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    /// UDP conversations idle past `timeout` and still live.
    pub fn idle_udp_keys(&self, timeout: Duration, now: Instant) -> Vec<FlowKey> {
        self.entries
            .values()
            .filter(|e| {
                e.key.is_udp()
                    && e.state != FlowState::Closed
                    && e.state != FlowState::Closing
                    && e.idle_for(now) > timeout
            })
            .map(|e| e.key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &NatEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RouteAction;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn make_tcp_key(src_port: u16, dst_port: u16) -> FlowKey {
        let src = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), src_port));
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), dst_port));
        FlowKey::tcp(src, dst)
    }

    fn make_udp_key(src_port: u16) -> FlowKey {
        let src = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), src_port));
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 4, 4), 53));
        FlowKey::udp(src, dst)
    }

    #[test]
    fn test_create_assigns_port_in_range() {
        let mut table = NatTable::new(100);
        let entry = table.create(make_tcp_key(12345, 443), Instant::now()).unwrap();
        assert!(entry.local_port >= LOCAL_PORT_MIN);
        assert_eq!(entry.state, FlowState::New);
        assert_eq!(entry.bytes_in, 0);
        assert_eq!(entry.bytes_out, 0);
    }

    #[test]
    fn test_create_existing_key_returns_same_entry() {
        let mut table = NatTable::new(100);
        let key = make_tcp_key(12345, 443);
        let now = Instant::now();

        let port1 = table.create(key, now).unwrap().local_port;
        let port2 = table.create(key, now).unwrap().local_port;
        assert_eq!(port1, port2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_port_uniqueness() {
        let mut table = NatTable::new(200);
        let now = Instant::now();

        let mut ports = std::collections::HashSet::new();
        for i in 0..150 {
            let entry = table.create(make_tcp_key(20000 + i, 443), now).unwrap();
            assert!(ports.insert(entry.local_port), "duplicate port");
            assert!(entry.local_port >= LOCAL_PORT_MIN);
        }
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut table = NatTable::new(2);
        let now = Instant::now();

        table.create(make_tcp_key(1, 443), now).unwrap();
        table.create(make_tcp_key(2, 443), now).unwrap();

        let result = table.create(make_tcp_key(3, 443), now);
        assert!(matches!(result, Err(PassageError::NatTableFull)));
        // existing entries unaffected
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_port_reuse_after_remove() {
        let mut table = NatTable::new(10);
        let now = Instant::now();
        let key = make_tcp_key(1, 443);

        let port = table.create(key, now).unwrap().local_port;
        table.remove(&key);
        assert!(table.get_by_port(port).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_route_is_write_once() {
        let mut table = NatTable::new(10);
        let now = Instant::now();
        let key = make_tcp_key(1, 443);

        let entry = table.create(key, now).unwrap();
        entry.set_route(RoutingDecision::new(RouteAction::Proxy));
        entry.set_route(RoutingDecision::new(RouteAction::Direct));

        assert_eq!(entry.route().unwrap().action, RouteAction::Proxy);
    }

    #[test]
    fn test_state_transitions_and_linger() {
        let mut table = NatTable::new(10);
        let t0 = Instant::now();
        let key = make_tcp_key(1, 443);

        let entry = table.create(key, t0).unwrap();
        entry.set_state(FlowState::Connecting, t0);
        entry.set_state(FlowState::Established, t0);
        entry.set_state(FlowState::Closing, t0);
        entry.set_state(FlowState::Closed, t0);

        let linger = Duration::from_secs(2);
        assert!(!entry.reclaimable(linger, t0));
        assert!(entry.reclaimable(linger, t0 + Duration::from_secs(3)));

        let reclaimed = table.reclaim_lingered(linger, t0 + Duration::from_secs(3));
        assert_eq!(reclaimed.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bytes_monotonic() {
        let mut table = NatTable::new(10);
        let now = Instant::now();
        let key = make_tcp_key(1, 443);
        table.create(key, now).unwrap();

        table.add_bytes_out(&key, 100, now);
        table.add_bytes_out(&key, 50, now);
        table.add_bytes_in(&key, 200, now);

        let entry = table.get(&key).unwrap();
        assert_eq!(entry.bytes_out, 150);
        assert_eq!(entry.bytes_in, 200);
    }

    #[test]
    fn test_idle_udp_detection() {
        let mut table = NatTable::new(10);
        let t0 = Instant::now();

        table.create(make_udp_key(9000), t0).unwrap();
        table.create(make_tcp_key(9001, 443), t0).unwrap();

        let timeout = Duration::from_secs(60);
        assert!(table.idle_udp_keys(timeout, t0).is_empty());

        let later = t0 + Duration::from_secs(61);
        let idle = table.idle_udp_keys(timeout, later);
        assert_eq!(idle.len(), 1);
        assert!(idle[0].is_udp());
    }

    #[test]
    fn test_lookup_by_port() {
        let mut table = NatTable::new(10);
        let now = Instant::now();
        let key = make_tcp_key(12345, 443);

        let port = table.create(key, now).unwrap().local_port;
        let entry = table.get_by_port(port).unwrap();
        assert_eq!(entry.key.src_port, 12345);
        assert_eq!(table.key_by_port(port), Some(&key));
    }
}
