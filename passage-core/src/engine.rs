//! Engine
//!
//! `PassageCore` is everything between "bytes in from the tunnel" and
//! "bytes out to an upstream socket", and back. The boundary shim owns one
//! instance behind a mutex; every method here runs with that lock held and
//! never suspends.

use std::net::IpAddr;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::error::{PassageError, Result};
use crate::flow::FlowManager;
use crate::packet::{IpVersion, ParsedPacket, TransportProtocol};
use crate::proxy::ProxyManager;
use crate::rule::{RouteAction, RuleLoadReport};
use crate::stack::{smoltcp_now, StackManager};
use crate::stats::EngineStats;

/// The core engine
pub struct PassageCore {
    config: EngineConfig,
    stack: StackManager,
    flows: FlowManager,
    proxy: ProxyManager,
    invalid_packets: u64,
    icmp_dropped: u64,
    ipv6_dropped: u64,
    nat_table_full: u64,
    rule_warnings: u64,
}

impl PassageCore {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "creating engine, upstream {}:{}",
            config.server_host,
            config.server_port
        );

        let stack = StackManager::new(config.queue_capacity, config.mtu, config.ipv6_enabled);
        let flows = FlowManager::new(config.clone())?;
        let proxy = ProxyManager::new(config.clone());

        Ok(Self {
            config,
            stack,
            flows,
            proxy,
            invalid_packets: 0,
            icmp_dropped: 0,
            ipv6_dropped: 0,
            nat_table_full: 0,
            rule_warnings: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Feed one datagram read from the tunnel device. Returns whatever the
    /// engine has ready to hand back to the platform.
    ///
    /// Packet-level problems are recovered locally: the packet is dropped,
    /// a counter bumped, and an empty batch returned.
    pub fn process_inbound(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>> {
        let parsed = match ParsedPacket::parse(packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.invalid_packets += 1;
                log::debug!("dropping invalid packet: {}", err);
                return Ok(Vec::new());
            }
        };

        if parsed.ip.version == IpVersion::V6 && !self.config.ipv6_enabled {
            self.ipv6_dropped += 1;
            return Ok(Vec::new());
        }

        let now = Instant::now();
        match parsed.ip.protocol {
            TransportProtocol::Icmp => {
                self.icmp_dropped += 1;
            }
            TransportProtocol::Other(_) => {
                self.invalid_packets += 1;
            }
            TransportProtocol::Tcp => {
                let key = match parsed.flow_key() {
                    Some(key) => key,
                    None => {
                        self.invalid_packets += 1;
                        return Ok(Vec::new());
                    }
                };

                let mut feed = true;
                if parsed.is_tcp_syn() {
                    let seq = parsed.tcp.as_ref().map(|t| t.seq_num).unwrap_or(0);
                    match self.flows.admit_tcp_syn(
                        key,
                        seq,
                        &mut self.stack,
                        &mut self.proxy,
                        now,
                    ) {
                        Ok(accepted) => feed = accepted,
                        Err(PassageError::NatTableFull) => {
                            self.nat_table_full += 1;
                            log::warn!("NAT table full, dropping SYN from {}", key.src_addr());
                            feed = false;
                        }
                        Err(err) => return Err(err),
                    }
                } else {
                    self.flows.note_activity(&key, now);
                }

                if feed {
                    self.stack.push_rx(packet.to_vec());
                }
            }
            TransportProtocol::Udp => {
                let key = match parsed.flow_key() {
                    Some(key) => key,
                    None => {
                        self.invalid_packets += 1;
                        return Ok(Vec::new());
                    }
                };
                let payload = parsed.udp_payload(packet).unwrap_or_default().to_vec();

                match self
                    .flows
                    .handle_udp_datagram(key, &payload, &mut self.proxy, now)
                {
                    Ok(()) => {}
                    Err(PassageError::NatTableFull) => {
                        self.nat_table_full += 1;
                        log::warn!("NAT table full, dropping datagram from {}", key.src_addr());
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.poll();
        Ok(self.stack.pop_tx_batch())
    }

    /// Funnel for packets already destined for the platform: validate,
    /// enqueue on the tx queue (drop-tail applies), return the drained
    /// batch.
    pub fn process_outbound(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>> {
        if let Err(err) = ParsedPacket::parse(packet) {
            self.invalid_packets += 1;
            log::debug!("dropping invalid outbound packet: {}", err);
            return Ok(Vec::new());
        }

        self.stack.push_tx(packet.to_vec());
        Ok(self.stack.pop_tx_batch())
    }

    /// One poll tick. The host calls this at >= 20 Hz.
    pub fn poll(&mut self) {
        self.poll_at(Instant::now(), smoltcp_now());
    }

    /// Clock-injectable poll, used by tests.
    pub fn poll_at(&mut self, now: Instant, smol_now: smoltcp::time::Instant) {
        self.flows
            .poll(&mut self.stack, &mut self.proxy, now, smol_now);
    }

    /// Drain everything waiting for the platform.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.stack.pop_tx_batch()
    }

    /// Replace the rule table. In-flight flows keep their cached decisions;
    /// only subsequent classifications see the new rules.
    pub fn load_rules(&mut self, text: &str) -> RuleLoadReport {
        let report = self.proxy.load_rules(text);
        self.rule_warnings += report.warnings.len() as u64;
        for warning in &report.warnings {
            log::warn!("rule line {}: {}", warning.line, warning.detail);
        }
        report
    }

    pub fn evaluate_route(
        &mut self,
        domain: Option<&str>,
        ip: Option<IpAddr>,
        port: u16,
    ) -> RouteAction {
        self.proxy.evaluate_route(domain, ip, port).action
    }

    pub fn enable_proxy(&mut self) {
        self.proxy.enable();
    }

    pub fn disable_proxy(&mut self) {
        self.proxy.disable();
    }

    pub fn is_proxy_enabled(&self) -> bool {
        self.proxy.is_enabled()
    }

    pub fn rule_count(&self) -> usize {
        self.proxy.rule_count()
    }

    /// Inject a GEOIP database; GEOIP rules never match without one.
    pub fn set_geoip_resolver(&mut self, resolver: Box<dyn crate::rule::GeoIpResolver>) {
        self.proxy.set_geoip_resolver(resolver);
    }

    pub fn get_stats(&self) -> EngineStats {
        let totals = self.flows.totals();
        let route = self.proxy.counters();

        EngineStats {
            bytes_sent: totals.bytes_sent,
            bytes_received: totals.bytes_received,
            active_connections: self.flows.active_flows() as u64,
            total_connections: totals.total_connections,
            direct_connections: route.direct,
            proxied_connections: route.proxied,
            rejected_connections: route.rejected,
            invalid_packets: self.invalid_packets,
            icmp_dropped: self.icmp_dropped,
            ipv6_dropped: self.ipv6_dropped,
            rx_dropped: self.stack.rx_dropped(),
            tx_dropped: self.stack.tx_dropped(),
            nat_table_full: self.nat_table_full,
            udp_proxy_fallback: totals.udp_proxy_fallback,
            rule_warnings: self.rule_warnings,
        }
    }

    /// Drop every flow (RST for TCP), cancel upstream I/O and leave the tx
    /// queue holding the final segments for the platform to drain.
    pub fn shutdown(&mut self) -> Vec<Vec<u8>> {
        log::info!("engine shutting down, {} flows live", self.flows.tracked_flows());
        self.flows.shutdown(&mut self.stack, Instant::now());
        self.stack.clear_rx();
        self.proxy.reset_counters();
        self.invalid_packets = 0;
        self.icmp_dropped = 0;
        self.ipv6_dropped = 0;
        self.nat_table_full = 0;
        self.rule_warnings = 0;
        self.stack.pop_tx_batch()
    }

    #[cfg(test)]
    pub(crate) fn flows(&self) -> &FlowManager {
        &self.flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::FlowKey;
    use crate::testutil;

    fn engine() -> PassageCore {
        PassageCore::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_engine_rejects_bad_config() {
        assert!(PassageCore::new(EngineConfig::new("", 1080)).is_err());
    }

    #[test]
    fn test_invalid_packet_recovered_locally() {
        let mut core = engine();
        let out = core.process_inbound(&[0xFF, 0x00, 0x01]).unwrap();
        assert!(out.is_empty());
        assert_eq!(core.get_stats().invalid_packets, 1);
    }

    #[test]
    fn test_icmp_dropped_with_counter() {
        let mut core = engine();
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[3] = 28;
        packet[9] = 1; // ICMP
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        packet[16..20].copy_from_slice(&[1, 1, 1, 1]);
        crate::packet::write_ipv4_header(
            &mut packet,
            "10.0.0.2".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
            1,
            28,
        );

        core.process_inbound(&packet).unwrap();
        assert_eq!(core.get_stats().icmp_dropped, 1);
    }

    #[test]
    fn test_ipv6_dropped_when_disabled() {
        let mut core = engine();
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&8u16.to_be_bytes());
        packet[6] = 17; // UDP
        // ports + length
        packet[40..42].copy_from_slice(&1000u16.to_be_bytes());
        packet[42..44].copy_from_slice(&53u16.to_be_bytes());
        packet[44..46].copy_from_slice(&8u16.to_be_bytes());

        core.process_inbound(&packet).unwrap();
        assert_eq!(core.get_stats().ipv6_dropped, 1);
    }

    #[test]
    fn test_direct_syn_produces_syn_ack() {
        let mut core = engine();
        core.load_rules("IP-CIDR,1.2.3.0/24,DIRECT\nFINAL,REJECT");

        let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40000, 80);
        let out = core.process_inbound(&syn).unwrap();

        let syn_ack = out
            .iter()
            .find(|p| {
                ParsedPacket::parse(p)
                    .ok()
                    .and_then(|pp| pp.tcp.map(|t| t.flags.is_syn_ack()))
                    .unwrap_or(false)
            })
            .expect("SYN-ACK expected in the response batch");
        let parsed = ParsedPacket::parse(syn_ack).unwrap();
        assert_eq!(parsed.tcp.as_ref().unwrap().src_port, 80);

        let stats = core.get_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.direct_connections, 1);
        assert_eq!(core.flows().tracked_flows(), 1);
    }

    #[test]
    fn test_rejected_syn_produces_rst() {
        let mut core = engine();
        core.load_rules("IP-CIDR,9.9.9.0/24,REJECT\nFINAL,DIRECT");

        let syn = testutil::syn_packet([10, 0, 0, 2], [9, 9, 9, 9], 40000, 443);
        let out = core.process_inbound(&syn).unwrap();

        assert!(out.iter().any(|p| {
            ParsedPacket::parse(p)
                .map(|pp| pp.is_tcp_rst())
                .unwrap_or(false)
        }));
        assert_eq!(core.get_stats().rejected_connections, 1);
    }

    #[test]
    fn test_syn_to_established_key_creates_no_new_flow() {
        let mut core = engine();
        core.load_rules("FINAL,DIRECT");

        let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40000, 80);
        core.process_inbound(&syn).unwrap();
        assert_eq!(core.get_stats().total_connections, 1);

        // retransmitted SYN for the same key
        core.process_inbound(&syn).unwrap();
        assert_eq!(core.get_stats().total_connections, 1);
        assert_eq!(core.flows().tracked_flows(), 1);
    }

    #[test]
    fn test_nat_exhaustion_drops_third_flow() {
        let config = EngineConfig::default().with_max_connections(2);
        let mut core = PassageCore::new(config).unwrap();
        core.load_rules("FINAL,DIRECT");

        for port in [40000u16, 40001] {
            let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], port, 80);
            core.process_inbound(&syn).unwrap();
        }
        assert_eq!(core.flows().tracked_flows(), 2);

        let third = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40002, 80);
        core.process_inbound(&third).unwrap();

        let stats = core.get_stats();
        assert_eq!(stats.nat_table_full, 1);
        assert_eq!(core.flows().tracked_flows(), 2);
    }

    #[test]
    fn test_rule_reload_keeps_inflight_decision() {
        let mut core = engine();
        core.load_rules("IP-CIDR,1.2.3.0/24,PROXY\nFINAL,DIRECT");

        let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40000, 8080);
        core.process_inbound(&syn).unwrap();

        let key = FlowKey::tcp(
            "10.0.0.2:40000".parse().unwrap(),
            "1.2.3.4:8080".parse().unwrap(),
        );
        let cached = core
            .flows()
            .nat()
            .get(&key)
            .unwrap()
            .route()
            .unwrap()
            .action;
        assert_eq!(cached, RouteAction::Proxy);

        // replace the table; the cached decision must not change
        core.load_rules("FINAL,DIRECT");
        let cached = core
            .flows()
            .nat()
            .get(&key)
            .unwrap()
            .route()
            .unwrap()
            .action;
        assert_eq!(cached, RouteAction::Proxy);

        // a fresh flow sees the new table
        assert_eq!(
            core.evaluate_route(None, Some("1.2.3.4".parse().unwrap()), 8080),
            RouteAction::Direct
        );
    }

    #[test]
    fn test_process_outbound_funnels_through_tx() {
        let mut core = engine();
        let datagram = testutil::udp_packet([8, 8, 8, 8], [10, 0, 0, 2], 53, 5353, b"reply");

        let out = core.process_outbound(&datagram).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], datagram);
    }

    #[test]
    fn test_shutdown_rsts_live_flows_and_resets_stats() {
        let mut core = engine();
        // domain rules defer classification, so the flow has no upstream yet
        // and sits waiting for its first payload until we shut down
        core.load_rules("DOMAIN-KEYWORD,blocked,REJECT\nFINAL,DIRECT");

        let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40000, 443);
        core.process_inbound(&syn).unwrap();
        assert_eq!(core.flows().tracked_flows(), 1);

        let final_batch = core.shutdown();
        assert!(final_batch.iter().any(|p| {
            ParsedPacket::parse(p)
                .map(|pp| pp.is_tcp_rst())
                .unwrap_or(false)
        }));

        let stats = core.get_stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.direct_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[test]
    fn test_evaluate_route_passthrough() {
        let mut core = engine();
        core.load_rules("DOMAIN-SUFFIX,example.com,PROXY\nFINAL,DIRECT");

        assert_eq!(
            core.evaluate_route(Some("api.example.com"), None, 443),
            RouteAction::Proxy
        );
        assert_eq!(
            core.evaluate_route(Some("other.org"), None, 443),
            RouteAction::Direct
        );
    }
}
