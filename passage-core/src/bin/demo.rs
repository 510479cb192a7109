//! Development walkthrough binary
//!
//! Exercises the engine without a platform tunnel: parses packets, loads
//! rules, pushes a few synthetic flows through the boundary and prints what
//! comes back.

use passage_core::packet::ParsedPacket;
use passage_core::rule::RuleEngine;
use passage_core::testutil;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== Passage Core Demo ===\n");

    demo_packet_parsing();
    demo_rule_engine();
    demo_boundary_pipeline();

    println!("\n=== Demo Complete ===");
}

fn demo_packet_parsing() {
    println!("--- Packet Parsing ---");

    let packet = testutil::syn_packet([10, 0, 0, 2], [8, 8, 8, 8], 12345, 443);
    match ParsedPacket::parse(&packet) {
        Ok(parsed) => {
            let tcp = parsed.tcp.as_ref().unwrap();
            println!("  {}:{} -> {}:{}", parsed.ip.src_ip, tcp.src_port, parsed.ip.dst_ip, tcp.dst_port);
            println!("  SYN: {}", parsed.is_tcp_syn());
        }
        Err(e) => println!("  parse error: {}", e),
    }
    println!();
}

fn demo_rule_engine() {
    println!("--- Rule Engine ---");

    let mut engine = RuleEngine::new();
    let report = engine.load_from_text(
        "DOMAIN-SUFFIX,google.com,PROXY\n\
         DOMAIN-KEYWORD,ads,REJECT\n\
         IP-CIDR,10.0.0.0/8,DIRECT\n\
         FINAL,DIRECT",
    );
    println!("  loaded {} rules, {} warnings", report.accepted, report.warnings.len());

    for host in ["www.google.com", "tracker-ads.net", "example.com"] {
        let action = engine.evaluate(Some(host), None, 443);
        println!("  {} -> {}", host, action);
    }
    println!();
}

fn demo_boundary_pipeline() {
    println!("--- Boundary Pipeline ---");

    passage_core::init_core("127.0.0.1".into(), 1080, None, None).unwrap();
    let count = passage_core::load_rules(
        "IP-CIDR,1.2.3.0/24,DIRECT\n\
         IP-CIDR,9.9.9.0/24,REJECT\n\
         FINAL,DIRECT"
            .into(),
    )
    .unwrap();
    println!("  initialized, {} rules", count);

    // a flow the table routes direct
    let syn = testutil::syn_packet([10, 0, 0, 2], [1, 2, 3, 4], 40000, 80);
    let responses = passage_core::process_inbound_packet(syn).unwrap();
    println!("  direct SYN -> {} response packet(s)", responses.len());

    // a flow the table rejects
    let syn = testutil::syn_packet([10, 0, 0, 2], [9, 9, 9, 9], 40001, 80);
    let responses = passage_core::process_inbound_packet(syn).unwrap();
    for packet in &responses {
        if let Ok(parsed) = ParsedPacket::parse(packet) {
            println!("  rejected SYN -> RST: {}", parsed.is_tcp_rst());
        }
    }

    passage_core::poll_core().unwrap();

    let stats = passage_core::get_stats().unwrap();
    println!(
        "  stats: total={} direct={} rejected={}",
        stats.total_connections, stats.direct_connections, stats.rejected_connections
    );
    println!("  control getStats -> {}", passage_core::handle_control("getStats").unwrap());
    println!(
        "  control route:1.2.3.4:80 -> {}",
        passage_core::handle_control("route:1.2.3.4:80").unwrap()
    );

    passage_core::shutdown_core().unwrap();
    println!("  shut down, initialized = {}", passage_core::is_initialized());
}
