//! Engine statistics
//!
//! Plain counters mutated under the boundary lock; no atomics are needed
//! because every caller enters through the shim serialized on one mutex.

use serde::Serialize;

/// Counters exposed through the boundary and the control channel.
///
/// Everything except `active_connections` is monotonic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub direct_connections: u64,
    pub proxied_connections: u64,
    pub rejected_connections: u64,
    /// Packets that failed header validation
    pub invalid_packets: u64,
    /// ICMP packets parsed and dropped
    pub icmp_dropped: u64,
    /// IPv6 packets dropped because forwarding is disabled
    pub ipv6_dropped: u64,
    /// Packets lost to rx queue drop-tail
    pub rx_dropped: u64,
    /// Packets lost to tx queue drop-tail
    pub tx_dropped: u64,
    /// Packets dropped because the NAT table was full
    pub nat_table_full: u64,
    /// UDP flows that matched Proxy and fell back to Direct
    pub udp_proxy_fallback: u64,
    /// Rule lines skipped or truncated during loading
    pub rule_warnings: u64,
}

impl EngineStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    /// Reset every counter. Used by shutdown.
    pub fn reset(&mut self) {
        *self = EngineStats::default();
    }
}
