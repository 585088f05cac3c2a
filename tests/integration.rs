//! End-to-end tests of the builder/parser binary contract.
//!
//! Probes are crafted with the real builders, wrapped into synthetic ICMP
//! reply frames, and fed through the parser: the same round trip a router
//! reply takes on the wire, minus the network.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use hopstorm::capture::Parser;
use hopstorm::packet::{
    build_icmp, build_ipv4, build_ipv6, build_udp, encode_timestamp, Packet, L2, L3, L4,
    PROBE_PAYLOAD_BASE,
};
use hopstorm::records::Reply;

const OUR_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 254);
const ROUTER_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Transmit instant, microseconds since the Unix epoch.
const SENT_EPOCH_US: u64 = 1_700_000_000_000_000;
/// Capture 12.3 ms later.
const CAPTURE_EPOCH_US: u64 = SENT_EPOCH_US + 12_300;

fn transmit_timestamp() -> u32 {
    encode_timestamp(Duration::from_micros(SENT_EPOCH_US))
}

/// Build the on-wire bytes of a UDP probe to `dst` with the given flow.
fn build_udp_probe_v4(dst: Ipv4Addr, src_port: u16, dst_port: u16, ttl: u8) -> Vec<u8> {
    let mut buffer = [0u8; 128];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Udp, PROBE_PAYLOAD_BASE).unwrap();
    packet.payload_mut()[2..6].copy_from_slice(&transmit_timestamp().to_be_bytes());
    build_ipv4(&mut packet, OUR_V4, dst, ttl).unwrap();
    build_udp(&mut packet, src_port, dst_port, Some(src_port)).unwrap();
    packet.as_bytes().to_vec()
}

fn build_icmp_probe_v4(dst: Ipv4Addr, src_port: u16, ttl: u8) -> Vec<u8> {
    let mut buffer = [0u8; 128];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, PROBE_PAYLOAD_BASE).unwrap();
    packet.payload_mut()[2..6].copy_from_slice(&transmit_timestamp().to_be_bytes());
    build_ipv4(&mut packet, OUR_V4, dst, ttl).unwrap();
    build_icmp(&mut packet, src_port, u16::from(ttl)).unwrap();
    packet.as_bytes().to_vec()
}

fn build_udp_probe_v6(dst: Ipv6Addr, src_port: u16, dst_port: u16, ttl: u8) -> Vec<u8> {
    let mut buffer = [0u8; 512];
    let payload_size = PROBE_PAYLOAD_BASE + usize::from(ttl);
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv6, L4::Udp, payload_size).unwrap();
    packet.payload_mut()[2..6].copy_from_slice(&transmit_timestamp().to_be_bytes());
    build_ipv6(&mut packet, "2001:db8::fe".parse().unwrap(), dst, ttl).unwrap();
    build_udp(&mut packet, src_port, dst_port, Some(src_port)).unwrap();
    packet.as_bytes().to_vec()
}

/// Wrap `quoted` into an ICMPv4 error from `router`, quoting `quote_len`
/// bytes of the original packet.
fn build_icmp_error_v4(router: Ipv4Addr, icmp_type: u8, quoted: &[u8], quote_len: usize) -> Vec<u8> {
    let quote = &quoted[..quote_len];
    let mut buffer = vec![0u8; 20 + 8 + quote.len()];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, quote.len()).unwrap();
    packet.payload_mut().copy_from_slice(quote);
    build_ipv4(&mut packet, router, OUR_V4, 250).unwrap();
    let l4 = packet.l4_mut();
    l4[0] = icmp_type;
    l4[1] = 0;
    packet.as_bytes().to_vec()
}

fn build_icmp_error_v6(router: Ipv6Addr, icmp_type: u8, quoted: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; 40 + 8 + quoted.len()];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv6, L4::Icmpv6, quoted.len()).unwrap();
    packet.payload_mut().copy_from_slice(quoted);
    build_ipv6(&mut packet, router, "2001:db8::fe".parse().unwrap(), 250).unwrap();
    let l4 = packet.l4_mut();
    l4[0] = icmp_type;
    l4[1] = 0;
    packet.as_bytes().to_vec()
}

#[test]
fn test_udp_ttl_exceeded_recovers_the_probe() {
    // A TTL-5 UDP probe expiring at a router that quotes the full packet.
    let probe = build_udp_probe_v4(Ipv4Addr::new(198, 51, 100, 10), 33000, 33435, 5);
    let frame = build_icmp_error_v4(ROUTER_V4, 11, &probe, probe.len());

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert_eq!(reply.reply_icmp_type, 11);
    assert_eq!(reply.reply_icmp_code, 0);
    assert_eq!(reply.reply_src_addr, ROUTER_V4);
    assert_eq!(reply.reply_dst_addr, OUR_V4);
    assert!(reply.is_icmp_time_exceeded());
    assert_eq!(reply.probe_dst_addr, Ipv4Addr::new(198, 51, 100, 10));
    assert_eq!(reply.probe_src_port, 33000);
    assert_eq!(reply.probe_dst_port, 33435);
    assert_eq!(reply.probe_ttl_l3, 5);
    assert_eq!(reply.probe_protocol, 17);
    assert_eq!(reply.probe_size, 34);
    assert!(
        (reply.rtt - 12.3).abs() < 0.11,
        "rtt should come from the embedded timestamp, got {}",
        reply.rtt
    );
}

#[test]
fn test_minimal_quote_recovers_ports_without_rtt() {
    // Routers quoting only IP + 8 bytes still identify the flow, but the
    // timestamp is gone.
    let probe = build_udp_probe_v4(Ipv4Addr::new(198, 51, 100, 10), 33001, 33436, 7);
    let frame = build_icmp_error_v4(ROUTER_V4, 11, &probe, 28);

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert_eq!(reply.probe_src_port, 33001);
    assert_eq!(reply.probe_dst_port, 33436);
    assert_eq!(reply.probe_ttl_l3, 7);
    assert!(reply.rtt.is_nan());
}

#[test]
fn test_icmp_probe_quoted_in_destination_unreachable() {
    let probe = build_icmp_probe_v4(Ipv4Addr::new(192, 0, 2, 1), 24000, 6);
    let frame = build_icmp_error_v4(ROUTER_V4, 3, &probe, probe.len());

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert!(reply.is_destination_unreachable());
    assert_eq!(reply.probe_protocol, 1);
    assert_eq!(reply.probe_src_port, 24000, "flow comes from the quoted id");
    assert_eq!(reply.probe_ttl_l3, 6, "TTL comes from the quoted IP id");
    assert_eq!(reply.probe_ttl_l4, 6, "TTL also echoed in the quoted seq");
    assert_eq!(reply.probe_dst_port, 0);
}

#[test]
fn test_icmp_echo_reply_single_hop() {
    // An echo responder one hop away: the reply quotes nothing, the id and
    // seq carry the flow and TTL.
    let destination = Ipv4Addr::new(192, 0, 2, 1);
    let mut buffer = [0u8; 64];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, PROBE_PAYLOAD_BASE).unwrap();
    packet.payload_mut()[2..6].copy_from_slice(&transmit_timestamp().to_be_bytes());
    build_ipv4(&mut packet, destination, OUR_V4, 63).unwrap();
    {
        let l4 = packet.l4_mut();
        l4[0] = 0; // echo reply
        l4[1] = 0;
        l4[4..6].copy_from_slice(&24000u16.to_be_bytes());
        l4[6..8].copy_from_slice(&1u16.to_be_bytes());
    }
    let frame = packet.as_bytes().to_vec();

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert_eq!(reply.reply_icmp_type, 0);
    assert!(reply.is_echo_reply());
    assert_eq!(reply.probe_src_port, 24000);
    assert_eq!(reply.probe_ttl_l3, 1);
    assert_eq!(reply.probe_dst_addr, destination);
    assert!(reply.is_from_destination());
    assert!((reply.rtt - 12.3).abs() < 0.11, "rtt={}", reply.rtt);
}

#[test]
fn test_icmpv6_echo_reply_recovers_ttl_from_payload_length() {
    // The reply payload mirrors the request, so payload_length still encodes
    // the TTL the probe was built with.
    let destination: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let ttl = 3u8;
    let mut buffer = [0u8; 512];
    let mut packet = Packet::new(
        &mut buffer,
        L2::None,
        L3::Ipv6,
        L4::Icmpv6,
        PROBE_PAYLOAD_BASE + usize::from(ttl),
    )
    .unwrap();
    packet.payload_mut()[2..6].copy_from_slice(&transmit_timestamp().to_be_bytes());
    build_ipv6(&mut packet, destination, "2001:db8::fe".parse().unwrap(), 61).unwrap();
    {
        let l4 = packet.l4_mut();
        l4[0] = 129; // echo reply
        l4[1] = 0;
        l4[4..6].copy_from_slice(&24500u16.to_be_bytes());
        l4[6..8].copy_from_slice(&u16::from(ttl).to_be_bytes());
    }
    let frame = packet.as_bytes().to_vec();

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert_eq!(reply.reply_icmp_type, 129);
    assert_eq!(reply.probe_ttl_l3, 3);
    assert_eq!(reply.probe_src_port, 24500);
    assert_eq!(reply.reply_protocol, 58);
    assert!((reply.rtt - 12.3).abs() < 0.11);
}

#[test]
fn test_udp_ttl_exceeded_ipv6() {
    let destination: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let router: Ipv6Addr = "2001:db8:1::a".parse().unwrap();
    let probe = build_udp_probe_v6(destination, 33010, 33440, 5);
    let frame = build_icmp_error_v6(router, 3, &probe);

    let reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();

    assert!(reply.is_icmp_time_exceeded());
    assert_eq!(reply.reply_src_addr, router);
    assert_eq!(reply.probe_dst_addr, destination);
    assert_eq!(reply.probe_src_port, 33010);
    assert_eq!(reply.probe_dst_port, 33440);
    assert_eq!(
        reply.probe_ttl_l3, 5,
        "TTL must come back out of the quoted payload length"
    );
    assert_eq!(reply.probe_size, 14 + 5);
    assert!((reply.rtt - 12.3).abs() < 0.11);
}

#[test]
fn test_flow_id_recoverability_across_flows() {
    // Distinct (dst, src_port, ttl) tuples all come back intact.
    for (dst, src_port, ttl) in [
        (Ipv4Addr::new(198, 51, 100, 1), 24000u16, 1u8),
        (Ipv4Addr::new(198, 51, 100, 2), 28123, 8),
        (Ipv4Addr::new(203, 0, 113, 77), 65535, 255),
    ] {
        let probe = build_udp_probe_v4(dst, src_port, 33434, ttl);
        let frame = build_icmp_error_v4(ROUTER_V4, 11, &probe, probe.len());
        let reply = Parser::new(L2::None)
            .parse(&frame, CAPTURE_EPOCH_US)
            .unwrap();
        assert_eq!(reply.probe_dst_addr, dst);
        assert_eq!(reply.probe_src_port, src_port);
        assert_eq!(reply.probe_ttl_l3, ttl);
    }
}

#[test]
fn test_corrupted_outer_checksum_is_dropped() {
    let probe = build_udp_probe_v4(Ipv4Addr::new(198, 51, 100, 10), 33000, 33435, 5);
    let mut frame = build_icmp_error_v4(ROUTER_V4, 11, &probe, probe.len());
    frame[10] ^= 0xFF; // corrupt the outer header checksum
    assert!(Parser::new(L2::None).parse(&frame, CAPTURE_EPOCH_US).is_err());
}

#[test]
fn test_foreign_ping_reply_is_dropped() {
    // An echo reply to somebody else's ping: seq far outside the TTL range.
    let mut buffer = [0u8; 128];
    let mut packet =
        Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, 56).unwrap();
    build_ipv4(&mut packet, ROUTER_V4, OUR_V4, 60).unwrap();
    {
        let l4 = packet.l4_mut();
        l4[0] = 0;
        l4[4..6].copy_from_slice(&4242u16.to_be_bytes());
        l4[6..8].copy_from_slice(&9999u16.to_be_bytes());
    }
    let frame = packet.as_bytes().to_vec();
    assert!(Parser::new(L2::None).parse(&frame, CAPTURE_EPOCH_US).is_err());
}

#[test]
fn test_parsed_reply_survives_the_csv_round_trip() {
    let probe = build_udp_probe_v4(Ipv4Addr::new(198, 51, 100, 10), 33000, 33435, 5);
    let frame = build_icmp_error_v4(ROUTER_V4, 11, &probe, probe.len());
    let mut reply = Parser::new(L2::None)
        .parse(&frame, CAPTURE_EPOCH_US)
        .unwrap();
    reply.round = "round-7".to_string();

    let parsed = Reply::from_csv(&reply.to_csv()).unwrap();
    assert_eq!(parsed.reply_src_addr, reply.reply_src_addr);
    assert_eq!(parsed.probe_dst_addr, reply.probe_dst_addr);
    assert_eq!(parsed.probe_src_port, reply.probe_src_port);
    assert_eq!(parsed.probe_ttl_l3, reply.probe_ttl_l3);
    assert_eq!(parsed.round, "round-7");
    assert!(parsed.success);
    assert!((parsed.rtt - reply.rtt).abs() < 0.051);
}
