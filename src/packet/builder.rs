//! Header writers for probe packets.
//!
//! These are meant to be called lowermost layer first: link, then IP, then
//! transport. The IPv6 builder must run before the ICMPv6/UDP builders since
//! their checksums cover the IPv6 pseudo-header.
//!
//! The transport builders take a `target_checksum`: the finished packet's
//! transport checksum is made to assume exactly that value by writing a
//! 2-byte adjustment at the start of the payload. This is what lets the
//! checksum field carry the flow identifier: it is the only transport field
//! ICMP errors are guaranteed to quote intact for ICMP probes, whose id/seq
//! are already repurposed.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::util::MacAddr;

use crate::checked::numeric_cast;
use crate::error::PacketError;

use super::{Packet, L3, L4, PAYLOAD_TWEAK_BYTES};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// BSD loopback address-family words.
const LOOPBACK_FAMILY_INET: u32 = 2;
const LOOPBACK_FAMILY_INET6: u32 = 30;

fn assert_payload_size(packet: &Packet, min_size: usize) -> Result<(), PacketError> {
    if packet.payload_size() < min_size {
        return Err(PacketError::PayloadTooSmall {
            required: min_size,
            available: packet.payload_size(),
        });
    }
    Ok(())
}

/// Sum 16-bit big-endian words onto a running one's-complement accumulator.
fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Fold the carries and close the sum.
fn checksum_finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

fn ipv4_pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4_size: u16) -> u32 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum += u32::from(protocol);
    sum += u32::from(l4_size);
    sum
}

fn ipv6_pseudo_header_sum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, l4_size: u16) -> u32 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum += u32::from(l4_size);
    sum += u32::from(next_header);
    sum
}

fn ipv4_addr_at(l3: &[u8], offset: usize) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    octets.copy_from_slice(&l3[offset..offset + 4]);
    Ipv4Addr::from(octets)
}

fn ipv6_addr_at(l3: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&l3[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Checksum of the transport header and payload as currently written,
/// including the pseudo-header for the protocols that require one (UDP and
/// ICMPv6; plain ICMP covers only its own bytes). The IP addresses must
/// already be in place. The checksum field itself is expected to be zero.
pub fn transport_checksum(packet: &Packet) -> Result<u16, PacketError> {
    let l4_size = numeric_cast::<usize, u16>(packet.l4_size())?;
    let sum = match packet.l3_protocol() {
        L3::Ipv4 => match packet.l4_protocol() {
            L4::Icmp => 0,
            _ => {
                let l3 = packet.l3();
                ipv4_pseudo_header_sum(
                    ipv4_addr_at(l3, 12),
                    ipv4_addr_at(l3, 16),
                    packet.l4_protocol().protocol_number(),
                    l4_size,
                )
            }
        },
        L3::Ipv6 => {
            let l3 = packet.l3();
            ipv6_pseudo_header_sum(
                ipv6_addr_at(l3, 8),
                ipv6_addr_at(l3, 24),
                packet.l4_protocol().protocol_number(),
                l4_size,
            )
        }
    };
    Ok(checksum_finish(checksum_add(sum, packet.l4())))
}

/// The 2-byte payload adjustment that moves a transport checksum from
/// `original_checksum` to `target_checksum`, both given as the host-order
/// values the standard computation produces. The adjustment bytes must have
/// been zero when `original_checksum` was computed.
pub fn tweak_payload(original_checksum: u16, target_checksum: u16) -> u16 {
    let original = u32::from(!original_checksum);
    let mut target = u32::from(!target_checksum);
    if target < original {
        target += 0xFFFF;
    }
    (target - original) as u16
}

/// Write the 4-byte loopback pseudo-header (host byte order).
pub fn build_loopback(packet: &mut Packet) {
    let family = match packet.l3_protocol() {
        L3::Ipv4 => LOOPBACK_FAMILY_INET,
        L3::Ipv6 => LOOPBACK_FAMILY_INET6,
    };
    packet.l2_mut()[..4].copy_from_slice(&family.to_ne_bytes());
}

/// Write the Ethernet header; the ethertype follows the packet's L3.
pub fn build_ethernet(packet: &mut Packet, src: MacAddr, dst: MacAddr) {
    let ethertype = match packet.l3_protocol() {
        L3::Ipv4 => ETHERTYPE_IPV4,
        L3::Ipv6 => ETHERTYPE_IPV6,
    };
    let l2 = packet.l2_mut();
    l2[..6].copy_from_slice(&dst.octets());
    l2[6..12].copy_from_slice(&src.octets());
    l2[12..14].copy_from_slice(&ethertype.to_be_bytes());
}

/// Fill the IPv4 header. The TTL is additionally stored in the
/// identification field, where ICMP errors quote it back.
pub fn build_ipv4(
    packet: &mut Packet,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
) -> Result<(), PacketError> {
    let total_length = numeric_cast::<usize, u16>(packet.l3_size())?;
    let protocol = packet.l4_protocol().protocol_number();
    let l3 = packet.l3_mut();
    l3[0] = 0x45; // version 4, 20-byte header
    l3[1] = 0;
    l3[2..4].copy_from_slice(&total_length.to_be_bytes());
    l3[4..6].copy_from_slice(&u16::from(ttl).to_be_bytes());
    l3[6..8].copy_from_slice(&[0, 0]);
    l3[8] = ttl;
    l3[9] = protocol;
    l3[10..12].copy_from_slice(&[0, 0]);
    l3[12..16].copy_from_slice(&src.octets());
    l3[16..20].copy_from_slice(&dst.octets());
    let checksum = checksum_finish(checksum_add(0, &l3[..20]));
    l3[10..12].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Fill the IPv6 header. The flow label is left at zero since it is used
/// for load balancing, unlike the IPv4 identification field, so the TTL is
/// recovered from the payload length instead. The caller sizes the payload
/// so that `l4_size = IPV6_PAYLOAD_LENGTH_BASE + ttl`.
pub fn build_ipv6(
    packet: &mut Packet,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    ttl: u8,
) -> Result<(), PacketError> {
    let payload_length = numeric_cast::<usize, u16>(packet.l4_size())?;
    let next_header = packet.l4_protocol().protocol_number();
    let l3 = packet.l3_mut();
    // 4 bits version, 8 bits traffic class, 20 bits flow label.
    l3[0..4].copy_from_slice(&0x6000_0000u32.to_be_bytes());
    l3[4..6].copy_from_slice(&payload_length.to_be_bytes());
    l3[6] = next_header;
    l3[7] = ttl;
    l3[8..24].copy_from_slice(&src.octets());
    l3[24..40].copy_from_slice(&dst.octets());
    Ok(())
}

/// Fill the ICMP echo-request header and make its checksum assume
/// `target_checksum`. The id field carries the same value; the seq field
/// carries `target_seq`.
pub fn build_icmp(
    packet: &mut Packet,
    target_checksum: u16,
    target_seq: u16,
) -> Result<(), PacketError> {
    assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;
    {
        let l4 = packet.l4_mut();
        l4[0] = 8; // echo request
        l4[1] = 0;
        l4[2..4].copy_from_slice(&[0, 0]);
        l4[4..6].copy_from_slice(&target_checksum.to_be_bytes());
        l4[6..8].copy_from_slice(&target_seq.to_be_bytes());
    }
    let original_checksum = transport_checksum(packet)?;
    let tweak = tweak_payload(original_checksum, target_checksum);
    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&tweak.to_be_bytes());
    packet.l4_mut()[2..4].copy_from_slice(&target_checksum.to_be_bytes());
    Ok(())
}

/// Same as [`build_icmp`] for ICMPv6. The checksum computation covers the
/// IPv6 pseudo-header, so the IPv6 header must already be filled.
pub fn build_icmpv6(
    packet: &mut Packet,
    target_checksum: u16,
    target_seq: u16,
) -> Result<(), PacketError> {
    assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;
    {
        let l4 = packet.l4_mut();
        l4[0] = 128; // echo request
        l4[1] = 0;
        l4[2..4].copy_from_slice(&[0, 0]);
        l4[4..6].copy_from_slice(&target_checksum.to_be_bytes());
        l4[6..8].copy_from_slice(&target_seq.to_be_bytes());
    }
    let original_checksum = transport_checksum(packet)?;
    let tweak = tweak_payload(original_checksum, target_checksum);
    packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&tweak.to_be_bytes());
    packet.l4_mut()[2..4].copy_from_slice(&target_checksum.to_be_bytes());
    Ok(())
}

/// Fill the UDP header. With a target checksum the tweak protocol applies;
/// without one the natural checksum is written (0xFFFF when it computes to
/// zero, since zero means "no checksum" on the wire). The IP header must
/// already be filled.
pub fn build_udp(
    packet: &mut Packet,
    src_port: u16,
    dst_port: u16,
    target_checksum: Option<u16>,
) -> Result<(), PacketError> {
    let length = numeric_cast::<usize, u16>(packet.l4_size())?;
    {
        let l4 = packet.l4_mut();
        l4[0..2].copy_from_slice(&src_port.to_be_bytes());
        l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
        l4[4..6].copy_from_slice(&length.to_be_bytes());
        l4[6..8].copy_from_slice(&[0, 0]);
    }
    match target_checksum {
        Some(target) => {
            assert_payload_size(packet, PAYLOAD_TWEAK_BYTES)?;
            let original_checksum = transport_checksum(packet)?;
            let tweak = tweak_payload(original_checksum, target);
            packet.payload_mut()[..PAYLOAD_TWEAK_BYTES].copy_from_slice(&tweak.to_be_bytes());
            packet.l4_mut()[6..8].copy_from_slice(&target.to_be_bytes());
        }
        None => {
            let checksum = match transport_checksum(packet)? {
                0 => 0xFFFF,
                c => c,
            };
            packet.l4_mut()[6..8].copy_from_slice(&checksum.to_be_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::L2;

    /// Reference RFC 1071 verification: a region whose checksum field is
    /// filled in sums to 0xFFFF.
    fn verifies(data: &[u8]) -> bool {
        let mut sum = checksum_add(0, data);
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
        sum == 0xFFFF
    }

    fn read_be16(data: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([data[offset], data[offset + 1]])
    }

    #[test]
    fn test_ipv4_header_fields() {
        let mut buffer = [0u8; 64];
        let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, 6).unwrap();
        build_ipv4(
            &mut packet,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 0, 2, 7),
            12,
        )
        .unwrap();
        let l3 = packet.l3();
        assert_eq!(l3[0], 0x45);
        assert_eq!(read_be16(l3, 2), 34); // total length
        assert_eq!(read_be16(l3, 4), 12); // identification carries the TTL
        assert_eq!(l3[8], 12);
        assert_eq!(l3[9], 1);
        assert!(verifies(&l3[..20]), "IPv4 header checksum must verify");
    }

    #[test]
    fn test_ipv6_header_fields() {
        let mut buffer = [0u8; 512];
        let ttl = 9u8;
        let payload = 6 + ttl as usize;
        let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv6, L4::Udp, payload).unwrap();
        build_ipv6(
            &mut packet,
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            ttl,
        )
        .unwrap();
        let l3 = packet.l3();
        assert_eq!(&l3[0..4], &0x6000_0000u32.to_be_bytes());
        assert_eq!(read_be16(l3, 4), 14 + u16::from(ttl));
        assert_eq!(l3[6], 17);
        assert_eq!(l3[7], ttl);
    }

    #[test]
    fn test_icmp_checksum_preservation() {
        // The standard checksum over the finished ICMP message must equal
        // the target, for arbitrary targets and a non-zero payload.
        for target in [0x0001u16, 0x1234, 0x8000, 0xCAFE, 0xFFFE] {
            let mut buffer = [0u8; 64];
            let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, 6).unwrap();
            packet.payload_mut()[2..6].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
            build_ipv4(
                &mut packet,
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(192, 0, 2, 7),
                5,
            )
            .unwrap();
            build_icmp(&mut packet, target, 5).unwrap();
            let l4 = packet.l4();
            assert_eq!(read_be16(l4, 2), target);
            assert_eq!(read_be16(l4, 4), target); // id mirrors the checksum
            assert!(verifies(l4), "target {target:#06x} must verify");
        }
    }

    #[test]
    fn test_icmpv6_checksum_preservation() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        for target in [0x0002u16, 0x4242, 0xBEEF] {
            let mut buffer = [0u8; 512];
            let ttl = 3u8;
            let mut packet =
                Packet::new(&mut buffer, L2::None, L3::Ipv6, L4::Icmpv6, 6 + ttl as usize)
                    .unwrap();
            packet.payload_mut()[2..6].copy_from_slice(&0x0102_0304u32.to_be_bytes());
            build_ipv6(&mut packet, src, dst, ttl).unwrap();
            build_icmpv6(&mut packet, target, u16::from(ttl)).unwrap();
            assert_eq!(read_be16(packet.l4(), 2), target);
            // Verify against the pseudo-header sum.
            let sum = ipv6_pseudo_header_sum(src, dst, 58, packet.l4_size() as u16);
            let mut sum = checksum_add(sum, packet.l4());
            while sum >> 16 != 0 {
                sum = (sum >> 16) + (sum & 0xFFFF);
            }
            assert_eq!(sum, 0xFFFF, "target {target:#06x} must verify");
        }
    }

    #[test]
    fn test_udp_checksum_preservation() {
        for target in [0x0001u16, 0x8399, 0xFFFE] {
            let mut buffer = [0u8; 64];
            let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Udp, 6).unwrap();
            packet.payload_mut()[2..6].copy_from_slice(&0x1122_3344u32.to_be_bytes());
            build_ipv4(
                &mut packet,
                Ipv4Addr::new(10, 0, 0, 9),
                Ipv4Addr::new(198, 51, 100, 10),
                7,
            )
            .unwrap();
            build_udp(&mut packet, 33000, 33435, Some(target)).unwrap();
            let l4 = packet.l4();
            assert_eq!(read_be16(l4, 0), 33000);
            assert_eq!(read_be16(l4, 2), 33435);
            assert_eq!(read_be16(l4, 4), 14);
            assert_eq!(read_be16(l4, 6), target);
            let sum = ipv4_pseudo_header_sum(
                Ipv4Addr::new(10, 0, 0, 9),
                Ipv4Addr::new(198, 51, 100, 10),
                17,
                14,
            );
            let mut sum = checksum_add(sum, l4);
            while sum >> 16 != 0 {
                sum = (sum >> 16) + (sum & 0xFFFF);
            }
            assert_eq!(sum, 0xFFFF, "target {target:#06x} must verify");
        }
    }

    #[test]
    fn test_udp_natural_checksum() {
        let mut buffer = [0u8; 64];
        let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Udp, 6).unwrap();
        build_ipv4(
            &mut packet,
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(198, 51, 100, 10),
            7,
        )
        .unwrap();
        build_udp(&mut packet, 33000, 33434, None).unwrap();
        let checksum = read_be16(packet.l4(), 6);
        assert_ne!(checksum, 0, "zero UDP checksum must be avoided");
    }

    #[test]
    fn test_payload_too_small() {
        let mut buffer = [0u8; 64];
        let mut packet = Packet::new(&mut buffer, L2::None, L3::Ipv4, L4::Icmp, 1).unwrap();
        let err = build_icmp(&mut packet, 0x1234, 1).unwrap_err();
        assert!(matches!(err, PacketError::PayloadTooSmall { .. }));
    }

    #[test]
    fn test_tweak_payload_wraps() {
        // target < original exercises the one's-complement wrap branch.
        let original = 0x0001u16;
        let target = 0xFFFEu16;
        let tweak = tweak_payload(original, target);
        let mut sum = u32::from(!original) + u32::from(tweak);
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
        assert_eq!(!(sum as u16), target);
    }

    #[test]
    fn test_ethernet_and_loopback_framing() {
        let mut buffer = [0u8; 64];
        let mut packet = Packet::new(&mut buffer, L2::Ethernet, L3::Ipv6, L4::Udp, 6).unwrap();
        build_ethernet(
            &mut packet,
            MacAddr::new(2, 0, 0, 0, 0, 1),
            MacAddr::new(2, 0, 0, 0, 0, 2),
        );
        let l2 = packet.l2();
        assert_eq!(read_be16(l2, 12), ETHERTYPE_IPV6);
        assert_eq!(l2[0], 2); // destination first
        assert_eq!(&l2[6..12], &[2, 0, 0, 0, 0, 1]);

        let mut buffer = [0u8; 64];
        let mut packet = Packet::new(&mut buffer, L2::Loopback, L3::Ipv4, L4::Icmp, 6).unwrap();
        build_loopback(&mut packet);
        assert_eq!(
            u32::from_ne_bytes([packet.l2()[0], packet.l2()[1], packet.l2()[2], packet.l2()[3]]),
            2
        );
    }
}
