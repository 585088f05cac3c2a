//! On-wire packet layout and construction.
//!
//! The builders and the reply parser share a binary contract: the probe TTL
//! lives in the IPv4 identification field (or, on IPv6, in the payload
//! length), the flow identifier lives in the transport checksum, and a
//! transmit timestamp is stamped into the payload. The constants below are
//! that contract; both sides must use them.

mod buffer;
mod builder;

pub use buffer::*;
pub use builder::*;

/// Bytes at the start of the payload reserved for the checksum adjustment.
pub const PAYLOAD_TWEAK_BYTES: usize = 2;

/// Bytes of transmit timestamp following the tweak bytes.
pub const TIMESTAMP_BYTES: usize = 4;

/// Fixed payload prefix carried by every probe: tweak bytes + timestamp.
pub const PROBE_PAYLOAD_BASE: usize = PAYLOAD_TWEAK_BYTES + TIMESTAMP_BYTES;

/// On IPv6 the TTL is recovered from the payload length:
/// `l4_size = IPV6_PAYLOAD_LENGTH_BASE + ttl`. The base is the 8-byte
/// transport header plus the fixed payload prefix, so a TTL-1 probe still
/// has room for the tweak and timestamp, and TTL 255 stays at 269 bytes.
pub const IPV6_PAYLOAD_LENGTH_BASE: u16 = 14;

/// Link-layer framing in front of the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2 {
    /// No framing; the buffer starts at the IP header.
    None,
    /// 4-byte BSD loopback pseudo-header.
    Loopback,
    /// 14-byte Ethernet II header.
    Ethernet,
}

impl L2 {
    pub fn header_size(self) -> usize {
        match self {
            L2::None => 0,
            L2::Loopback => 4,
            L2::Ethernet => 14,
        }
    }
}

/// Network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3 {
    Ipv4,
    Ipv6,
}

impl L3 {
    pub fn header_size(self) -> usize {
        match self {
            L3::Ipv4 => 20,
            L3::Ipv6 => 40,
        }
    }
}

/// Transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4 {
    Icmp,
    Icmpv6,
    Udp,
}

impl L4 {
    pub fn header_size(self) -> usize {
        match self {
            L4::Icmp | L4::Icmpv6 | L4::Udp => 8,
        }
    }

    /// IANA protocol number, as written into the IP header.
    pub fn protocol_number(self) -> u8 {
        match self {
            L4::Icmp => 1,
            L4::Icmpv6 => 58,
            L4::Udp => 17,
        }
    }
}

/// Encode a transmit time as the low 32 bits of the tenth-of-millisecond
/// Unix time. Wraps roughly every 5 days; the parser takes the wrapping
/// difference against the capture timestamp.
pub fn encode_timestamp(since_epoch: std::time::Duration) -> u32 {
    (since_epoch.as_micros() / 100) as u32
}

/// Estimated round-trip time in milliseconds, given the capture timestamp in
/// microseconds since the Unix epoch and the timestamp embedded in the probe.
pub fn decode_rtt(capture_timestamp_us: u64, encoded: u32) -> f64 {
    let captured = (capture_timestamp_us / 100) as u32;
    f64::from(captured.wrapping_sub(encoded)) / 10.0
}
