//! Passage Core - per-device packet-interception proxy engine
//!
//! Raw IP datagrams come in from a virtual TUN device, transport flows are
//! terminated in a userspace smoltcp stack, classified against a rule
//! table, and forwarded through a SOCKS5 upstream, connected directly, or
//! rejected. Return traffic is reassembled into IP datagrams for the
//! platform to inject.

// Public modules
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod flow;
pub mod nat;
pub mod packet;
pub mod proxy;
pub mod rule;
pub mod sniff;
pub mod socks5;
pub mod stack;
pub mod stats;
pub mod testutil;

// Re-exports for convenience
pub use config::EngineConfig;
pub use engine::PassageCore;
pub use error::PassageError;
pub use flow::FlowManager;
pub use nat::{FlowKey, FlowState, NatEntry, NatTable};
pub use packet::{IpPacketInfo, ParsedPacket, TcpFlags, TcpPacketInfo, UdpPacketInfo};
pub use proxy::{ProxyManager, RoutingDecision};
pub use rule::{GeoIpResolver, RouteAction, Rule, RuleEngine, RuleMatcher};
pub use socks5::{Socks5Client, TargetAddr};
pub use stack::StackManager;
pub use stats::EngineStats;

// Boundary exports
pub use ffi::{
    disable_proxy, enable_proxy, evaluate_route, get_core_version, get_outbound_packets,
    get_stats, handle_control, init_core, init_core_with_config, is_initialized,
    is_proxy_enabled, load_rules, poll_core, process_inbound_packet, process_outbound_packet,
    rule_count, shutdown_core,
};
