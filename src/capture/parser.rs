//! Decode captured frames into reply records.
//!
//! This is the receiving half of the builder's binary contract: the probe
//! TTL comes back in the quoted IPv4 identification field or, on IPv6, in
//! the quoted payload length; the flow identifier comes back in the quoted
//! ICMP id or UDP ports/checksum; the transmit timestamp sits at bytes 2..6
//! of the quoted payload when the router quoted that much.

use std::net::IpAddr;

use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;

use crate::error::NotAMatch;
use crate::packet::{decode_rtt, L2, IPV6_PAYLOAD_LENGTH_BASE, PROBE_PAYLOAD_BASE};
use crate::records::{
    Reply, ICMP6_DEST_UNREACHABLE, ICMP6_ECHO_REPLY, ICMP6_TIME_EXCEEDED,
    ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_TIME_EXCEEDED,
};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

/// ICMP multipart extensions (RFC 4884) and the MPLS label stack object
/// carried in them (RFC 4950).
const ICMP_EXT_VERSION: u8 = 2;
const MPLS_LABEL_STACK_CLASS: u8 = 1;
const MPLS_LABEL_STACK_TYPE: u8 = 1;
const MIN_ORIGINAL_DATAGRAM: usize = 128;

/// BSD loopback address-family words.
const LOOPBACK_FAMILY_INET: u32 = 2;
const LOOPBACK_FAMILY_INET6: [u32; 3] = [24, 28, 30];

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

fn read_be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_be32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Stateless frame decoder for one capture handle's link type.
pub struct Parser {
    l2: L2,
}

impl Parser {
    pub fn new(l2: L2) -> Self {
        Self { l2 }
    }

    /// Decode one captured frame. `capture_timestamp` is microseconds since
    /// the Unix epoch, from the capture header.
    pub fn parse(&self, data: &[u8], capture_timestamp: u64) -> Result<Reply, NotAMatch> {
        match self.l2 {
            L2::Ethernet => {
                if data.len() < 14 {
                    return Err(NotAMatch::Truncated(data.len()));
                }
                match read_be16(data, 12) {
                    ETHERTYPE_IPV4 => self.parse_ipv4(&data[14..], capture_timestamp),
                    ETHERTYPE_IPV6 => self.parse_ipv6(&data[14..], capture_timestamp),
                    other => Err(NotAMatch::UnsupportedEtherType(other)),
                }
            }
            L2::Loopback => {
                if data.len() < 4 {
                    return Err(NotAMatch::Truncated(data.len()));
                }
                // The loopback family word is in host byte order.
                let family =
                    u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
                if family == LOOPBACK_FAMILY_INET {
                    self.parse_ipv4(&data[4..], capture_timestamp)
                } else if LOOPBACK_FAMILY_INET6.contains(&family) {
                    self.parse_ipv6(&data[4..], capture_timestamp)
                } else {
                    Err(NotAMatch::UnsupportedLinkLayer)
                }
            }
            L2::None => {
                if data.is_empty() {
                    return Err(NotAMatch::Truncated(0));
                }
                match data[0] >> 4 {
                    4 => self.parse_ipv4(data, capture_timestamp),
                    6 => self.parse_ipv6(data, capture_timestamp),
                    _ => Err(NotAMatch::UnsupportedLinkLayer),
                }
            }
        }
    }

    fn parse_ipv4(&self, data: &[u8], capture_timestamp: u64) -> Result<Reply, NotAMatch> {
        let ip = Ipv4Packet::new(data).ok_or(NotAMatch::Truncated(data.len()))?;
        let header_length = usize::from(ip.get_header_length()) * 4;
        if header_length < 20 || data.len() < header_length + 8 {
            return Err(NotAMatch::Truncated(data.len()));
        }
        if pnet::packet::ipv4::checksum(&ip) != ip.get_checksum() {
            return Err(NotAMatch::InvalidChecksum);
        }
        let protocol = ip.get_next_level_protocol().0;
        if protocol != IPPROTO_ICMP {
            return Err(NotAMatch::UnsupportedProtocol(protocol));
        }

        let icmp = &data[header_length..];
        let mut reply = Reply {
            capture_timestamp,
            reply_src_addr: IpAddr::V4(ip.get_source()),
            reply_dst_addr: IpAddr::V4(ip.get_destination()),
            reply_size: ip.get_total_length(),
            reply_ttl: ip.get_ttl(),
            reply_protocol: IPPROTO_ICMP,
            reply_icmp_type: icmp[0],
            reply_icmp_code: icmp[1],
            ..Reply::default()
        };

        match icmp[0] {
            ICMP_TIME_EXCEEDED | ICMP_DEST_UNREACHABLE => {
                parse_quoted_ipv4(icmp, &mut reply)?;
            }
            ICMP_ECHO_REPLY => {
                parse_echo_ipv4(icmp, &mut reply)?;
            }
            other => return Err(NotAMatch::UnexpectedIcmpType(other)),
        }
        Ok(reply)
    }

    fn parse_ipv6(&self, data: &[u8], capture_timestamp: u64) -> Result<Reply, NotAMatch> {
        let ip = Ipv6Packet::new(data).ok_or(NotAMatch::Truncated(data.len()))?;
        // Extension header chains never occur on our probe replies.
        let next_header = ip.get_next_header().0;
        if next_header != IPPROTO_ICMPV6 {
            return Err(NotAMatch::UnsupportedProtocol(next_header));
        }
        if data.len() < 40 + 8 {
            return Err(NotAMatch::Truncated(data.len()));
        }

        let icmp = &data[40..];
        let mut reply = Reply {
            capture_timestamp,
            reply_src_addr: IpAddr::V6(ip.get_source()),
            reply_dst_addr: IpAddr::V6(ip.get_destination()),
            // Excludes the IPv6 header, as the payload length field does.
            reply_size: ip.get_payload_length(),
            reply_ttl: ip.get_hop_limit(),
            reply_protocol: IPPROTO_ICMPV6,
            reply_icmp_type: icmp[0],
            reply_icmp_code: icmp[1],
            ..Reply::default()
        };

        match icmp[0] {
            ICMP6_TIME_EXCEEDED | ICMP6_DEST_UNREACHABLE => {
                parse_quoted_ipv6(icmp, &mut reply)?;
            }
            ICMP6_ECHO_REPLY => {
                parse_echo_ipv6(icmp, &mut reply)?;
            }
            other => return Err(NotAMatch::UnexpectedIcmpType(other)),
        }
        Ok(reply)
    }
}

/// Recover the probe from the quoted IPv4 packet at offset 8 of an ICMP
/// error message.
fn parse_quoted_ipv4(icmp: &[u8], reply: &mut Reply) -> Result<(), NotAMatch> {
    if icmp.len() < 8 + 20 + 8 {
        return Err(NotAMatch::Truncated(icmp.len()));
    }
    let inner = &icmp[8..];
    if inner[0] >> 4 != 4 {
        return Err(NotAMatch::MalformedQuote);
    }
    let inner_header_length = usize::from(inner[0] & 0x0F) * 4;
    if inner_header_length < 20 || inner.len() < inner_header_length + 8 {
        return Err(NotAMatch::MalformedQuote);
    }

    // The identification field carries the TTL the probe was built with.
    let encoded_ttl = read_be16(inner, 4);
    if !(1..=255).contains(&encoded_ttl) {
        return Err(NotAMatch::TtlOutOfRange(encoded_ttl));
    }
    reply.probe_ttl_l3 = encoded_ttl as u8;
    reply.probe_size = read_be16(inner, 2);
    reply.probe_dst_addr = IpAddr::V4([inner[16], inner[17], inner[18], inner[19]].into());
    reply.probe_protocol = inner[9];

    let transport = &inner[inner_header_length..];
    match reply.probe_protocol {
        IPPROTO_ICMP => {
            // Echo request: the id quotes the flow checksum, the seq the TTL.
            reply.probe_src_port = read_be16(transport, 4);
            reply.probe_dst_port = 0;
            let seq = read_be16(transport, 6);
            reply.probe_ttl_l4 = u8::try_from(seq).unwrap_or(0);
        }
        IPPROTO_UDP => {
            reply.probe_src_port = read_be16(transport, 0);
            reply.probe_dst_port = read_be16(transport, 2);
            reply.probe_ttl_l4 = 0;
        }
        other => return Err(NotAMatch::UnsupportedProtocol(other)),
    }

    reply.rtt = quoted_rtt(transport, reply.capture_timestamp);
    reply.reply_mpls_labels = parse_mpls_labels(inner, icmp[5], 4);
    Ok(())
}

/// Recover the probe from the quoted IPv6 packet at offset 8 of an ICMPv6
/// error message.
fn parse_quoted_ipv6(icmp: &[u8], reply: &mut Reply) -> Result<(), NotAMatch> {
    if icmp.len() < 8 + 40 + 8 {
        return Err(NotAMatch::Truncated(icmp.len()));
    }
    let inner = &icmp[8..];
    if inner[0] >> 4 != 6 {
        return Err(NotAMatch::MalformedQuote);
    }

    // The payload length carries the TTL: l4_size = base + ttl.
    let payload_length = read_be16(inner, 4);
    let encoded_ttl = payload_length.wrapping_sub(IPV6_PAYLOAD_LENGTH_BASE);
    if !(1..=255).contains(&encoded_ttl) {
        return Err(NotAMatch::TtlOutOfRange(encoded_ttl));
    }
    reply.probe_ttl_l3 = encoded_ttl as u8;
    reply.probe_size = payload_length;
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&inner[24..40]);
    reply.probe_dst_addr = IpAddr::V6(dst.into());
    reply.probe_protocol = inner[6];

    let transport = &inner[40..];
    match reply.probe_protocol {
        IPPROTO_ICMPV6 => {
            reply.probe_src_port = read_be16(transport, 4);
            reply.probe_dst_port = 0;
            let seq = read_be16(transport, 6);
            reply.probe_ttl_l4 = u8::try_from(seq).unwrap_or(0);
        }
        IPPROTO_UDP => {
            reply.probe_src_port = read_be16(transport, 0);
            reply.probe_dst_port = read_be16(transport, 2);
            reply.probe_ttl_l4 = 0;
        }
        other => return Err(NotAMatch::UnsupportedProtocol(other)),
    }

    reply.rtt = quoted_rtt(transport, reply.capture_timestamp);
    // ICMPv6 counts the original datagram in 64-bit words (RFC 4884 §4.5).
    reply.reply_mpls_labels = parse_mpls_labels(inner, icmp[4], 8);
    Ok(())
}

/// An echo reply quotes nothing; the probe attributes come from the echoed
/// id/seq and, on IPv6, the echoed payload length.
fn parse_echo_ipv4(icmp: &[u8], reply: &mut Reply) -> Result<(), NotAMatch> {
    let seq = read_be16(icmp, 6);
    if !(1..=255).contains(&seq) {
        return Err(NotAMatch::TtlOutOfRange(seq));
    }
    reply.probe_dst_addr = reply.reply_src_addr;
    reply.probe_size = reply.reply_size;
    reply.probe_ttl_l3 = seq as u8;
    reply.probe_ttl_l4 = seq as u8;
    reply.probe_protocol = IPPROTO_ICMP;
    reply.probe_src_port = read_be16(icmp, 4);
    reply.probe_dst_port = 0;
    reply.rtt = quoted_rtt(icmp, reply.capture_timestamp);
    Ok(())
}

fn parse_echo_ipv6(icmp: &[u8], reply: &mut Reply) -> Result<(), NotAMatch> {
    // The reply payload mirrors the request, so its length encodes the TTL
    // the same way the probe's did.
    let encoded_ttl = reply.reply_size.wrapping_sub(IPV6_PAYLOAD_LENGTH_BASE);
    if !(1..=255).contains(&encoded_ttl) {
        return Err(NotAMatch::TtlOutOfRange(encoded_ttl));
    }
    reply.probe_dst_addr = reply.reply_src_addr;
    reply.probe_size = reply.reply_size;
    reply.probe_ttl_l3 = encoded_ttl as u8;
    reply.probe_ttl_l4 = u8::try_from(read_be16(icmp, 6)).unwrap_or(0);
    reply.probe_protocol = IPPROTO_ICMPV6;
    reply.probe_src_port = read_be16(icmp, 4);
    reply.probe_dst_port = 0;
    reply.rtt = quoted_rtt(icmp, reply.capture_timestamp);
    Ok(())
}

/// RTT from the transmit timestamp at bytes 2..6 of the payload following an
/// 8-byte transport header, when the capture quoted that much. NaN otherwise.
fn quoted_rtt(transport: &[u8], capture_timestamp: u64) -> f64 {
    if transport.len() < 8 + PROBE_PAYLOAD_BASE {
        return f64::NAN;
    }
    decode_rtt(capture_timestamp, read_be32(transport, 10))
}

/// Walk the ICMP multipart extension for an MPLS label stack.
///
/// `original_datagram` starts right after the 8-byte ICMP header;
/// `length_field` is the RFC 4884 length in `word_size`-byte words (zero
/// means the legacy fixed 128-byte original datagram).
fn parse_mpls_labels(original_datagram: &[u8], length_field: u8, word_size: usize) -> Vec<u32> {
    let ext_start = if length_field > 0 {
        usize::from(length_field) * word_size
    } else {
        MIN_ORIGINAL_DATAGRAM
    };
    if original_datagram.len() < ext_start + 4 {
        return Vec::new();
    }

    let ext = &original_datagram[ext_start..];
    if ext[0] >> 4 != ICMP_EXT_VERSION {
        return Vec::new();
    }

    // Object header: length, class, c-type; objects follow the 4-byte
    // extension header.
    let mut offset = 4;
    while offset + 4 <= ext.len() {
        let object_length = usize::from(read_be16(ext, offset));
        let class = ext[offset + 2];
        let c_type = ext[offset + 3];
        if object_length < 4 || offset + object_length > ext.len() {
            break;
        }
        if class == MPLS_LABEL_STACK_CLASS && c_type == MPLS_LABEL_STACK_TYPE {
            let mut labels = Vec::new();
            for chunk in ext[offset + 4..offset + object_length].chunks_exact(4) {
                let entry = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                labels.push(entry >> 12);
                if entry & 0x100 != 0 {
                    break; // bottom of stack
                }
            }
            return labels;
        }
        offset += object_length;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpls_extension_with_explicit_length() {
        // 32 words = 128 bytes of original datagram, then the extension.
        let mut datagram = vec![0u8; 128];
        datagram.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]); // version 2
        datagram.extend_from_slice(&[0x00, 0x0C, 0x01, 0x01]); // 12-byte MPLS object
        datagram.extend_from_slice(&(24015u32 << 12).to_be_bytes());
        datagram.extend_from_slice(&((3u32 << 12) | 0x100).to_be_bytes()); // bottom
        let labels = parse_mpls_labels(&datagram, 32, 4);
        assert_eq!(labels, vec![24015, 3]);
    }

    #[test]
    fn test_mpls_extension_stops_at_bottom_of_stack() {
        let mut datagram = vec![0u8; 128];
        datagram.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        datagram.extend_from_slice(&[0x00, 0x10, 0x01, 0x01]); // 16-byte object
        datagram.extend_from_slice(&((7u32 << 12) | 0x100).to_be_bytes()); // bottom first
        datagram.extend_from_slice(&(9u32 << 12).to_be_bytes());
        datagram.extend_from_slice(&(11u32 << 12).to_be_bytes());
        let labels = parse_mpls_labels(&datagram, 0, 4);
        assert_eq!(labels, vec![7]);
    }

    #[test]
    fn test_mpls_extension_absent() {
        assert!(parse_mpls_labels(&[0u8; 64], 0, 4).is_empty());
        // Wrong version nibble.
        let mut datagram = vec![0u8; 128];
        datagram.extend_from_slice(&[0x10, 0x00, 0x00, 0x00]);
        assert!(parse_mpls_labels(&datagram, 0, 4).is_empty());
    }

    #[test]
    fn test_mpls_extension_ignores_foreign_objects() {
        let mut datagram = vec![0u8; 128];
        datagram.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        datagram.extend_from_slice(&[0x00, 0x08, 0x02, 0x01]); // interface info object
        datagram.extend_from_slice(&[0xAA; 4]);
        datagram.extend_from_slice(&[0x00, 0x08, 0x01, 0x01]);
        datagram.extend_from_slice(&(42u32 << 12 | 0x100).to_be_bytes());
        let labels = parse_mpls_labels(&datagram, 32, 4);
        assert_eq!(labels, vec![42]);
    }

    #[test]
    fn test_truncated_frames_do_not_match() {
        let parser = Parser::new(L2::None);
        assert!(matches!(
            parser.parse(&[], 0),
            Err(NotAMatch::Truncated(0))
        ));
        assert!(parser.parse(&[0x45, 0x00], 0).is_err());
        let parser = Parser::new(L2::Ethernet);
        assert!(parser.parse(&[0u8; 10], 0).is_err());
    }

    #[test]
    fn test_unknown_ethertype_does_not_match() {
        let parser = Parser::new(L2::Ethernet);
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert_eq!(
            parser.parse(&frame, 0),
            Err(NotAMatch::UnsupportedEtherType(0x0806))
        );
    }
}
