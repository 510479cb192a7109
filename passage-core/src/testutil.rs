//! Packet construction helpers for tests and the demo binary
//!
//! The stack verifies IP and transport checksums on ingest, so hand-built
//! packets must carry real ones.

use std::net::Ipv4Addr;

use crate::packet::{
    transport_checksum, write_ipv4_header, IPV4_MIN_HEADER_LEN, PROTO_TCP, PROTO_UDP,
    TCP_MIN_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::packet::TcpFlags;

/// Build a checksummed IPv4 TCP segment.
pub fn tcp_packet(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
) -> Vec<u8> {
    tcp_packet_with_payload(src_ip, dst_ip, src_port, dst_port, flags, seq, ack, &[])
}

/// Build a checksummed IPv4 TCP segment carrying `payload`.
#[allow(clippy::too_many_arguments)]
pub fn tcp_packet_with_payload(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len();
    let mut packet = vec![0u8; total_len];

    {
        let tcp = &mut packet[IPV4_MIN_HEADER_LEN..];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = flags.to_byte();
        tcp[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes()); // window
        tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);
    }

    let src = Ipv4Addr::from(src_ip);
    let dst = Ipv4Addr::from(dst_ip);

    let checksum = transport_checksum(src, dst, PROTO_TCP, &packet[IPV4_MIN_HEADER_LEN..], 16);
    packet[IPV4_MIN_HEADER_LEN + 16..IPV4_MIN_HEADER_LEN + 18]
        .copy_from_slice(&checksum.to_be_bytes());

    write_ipv4_header(&mut packet, src, dst, PROTO_TCP, total_len as u16);
    packet
}

/// Build a checksummed IPv4 UDP datagram.
pub fn udp_packet(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut packet = vec![0u8; total_len];

    {
        let udp = &mut packet[IPV4_MIN_HEADER_LEN..];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[UDP_HEADER_LEN..].copy_from_slice(payload);
    }

    let src = Ipv4Addr::from(src_ip);
    let dst = Ipv4Addr::from(dst_ip);

    let mut checksum = transport_checksum(src, dst, PROTO_UDP, &packet[IPV4_MIN_HEADER_LEN..], 6);
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    packet[IPV4_MIN_HEADER_LEN + 6..IPV4_MIN_HEADER_LEN + 8]
        .copy_from_slice(&checksum.to_be_bytes());

    write_ipv4_header(&mut packet, src, dst, PROTO_UDP, total_len as u16);
    packet
}

/// Build a plain SYN from `src` to `dst`, the common case in tests.
pub fn syn_packet(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    tcp_packet(
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        1,
        0,
    )
}
