//! Reply records: one matched ICMP message per CSV line.
//!
//! All numeric fields are in host byte order. A reply carries both the outer
//! message attributes and the probe attributes recovered from the quoted
//! packet (or, for echo replies, from the echoed header itself).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::CsvError;

pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_ECHO_REPLY: u8 = 129;

/// A matched traceroute reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Capture time, microseconds since the Unix epoch.
    pub capture_timestamp: u64,
    /// Source of the reply packet.
    pub reply_src_addr: IpAddr,
    /// Destination of the reply packet (our address).
    pub reply_dst_addr: IpAddr,
    /// Size of the reply in bytes. Excludes the IP header on IPv6.
    pub reply_size: u16,
    pub reply_ttl: u8,
    pub reply_protocol: u8,
    pub reply_icmp_type: u8,
    pub reply_icmp_code: u8,
    /// MPLS label values from the ICMP extension, outermost first.
    pub reply_mpls_labels: Vec<u32>,
    /// The address the probe targeted. Equal to `reply_src_addr` when the
    /// destination itself answered.
    pub probe_dst_addr: IpAddr,
    /// Size of the probe in bytes. Excludes the IP header on IPv6.
    pub probe_size: u16,
    /// Probe TTL recovered from the quoted network header.
    pub probe_ttl_l3: u8,
    pub probe_protocol: u8,
    pub probe_src_port: u16,
    pub probe_dst_port: u16,
    /// Probe TTL echoed in the transport header, 0 if not available.
    pub probe_ttl_l4: u8,
    /// Estimated round-trip time in milliseconds, NaN when the transmit
    /// timestamp was not present in the quote.
    pub rtt: f64,
    /// Opaque round tag.
    pub round: String,
    pub success: bool,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            capture_timestamp: 0,
            reply_src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_size: 0,
            reply_ttl: 0,
            reply_protocol: 0,
            reply_icmp_type: 0,
            reply_icmp_code: 0,
            reply_mpls_labels: Vec::new(),
            probe_dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            probe_size: 0,
            probe_ttl_l3: 0,
            probe_protocol: 0,
            probe_src_port: 0,
            probe_dst_port: 0,
            probe_ttl_l4: 0,
            rtt: f64::NAN,
            round: String::new(),
            success: true,
        }
    }
}

impl Reply {
    pub fn is_icmp_time_exceeded(&self) -> bool {
        matches!(
            (self.reply_protocol, self.reply_icmp_type),
            (1, ICMP_TIME_EXCEEDED) | (58, ICMP6_TIME_EXCEEDED)
        )
    }

    pub fn is_destination_unreachable(&self) -> bool {
        matches!(
            (self.reply_protocol, self.reply_icmp_type),
            (1, ICMP_DEST_UNREACHABLE) | (58, ICMP6_DEST_UNREACHABLE)
        )
    }

    pub fn is_echo_reply(&self) -> bool {
        matches!(
            (self.reply_protocol, self.reply_icmp_type),
            (1, ICMP_ECHO_REPLY) | (58, ICMP6_ECHO_REPLY)
        )
    }

    /// Whether the reply came from the probed destination itself, as opposed
    /// to a router on the path.
    pub fn is_from_destination(&self) -> bool {
        self.reply_src_addr == self.probe_dst_addr
    }

    /// Serialize the reply in the CSV format.
    pub fn to_csv(&self) -> String {
        let labels = self
            .reply_mpls_labels
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join("|");
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.1},{},{}",
            self.capture_timestamp,
            self.reply_src_addr,
            self.reply_dst_addr,
            self.reply_size,
            self.reply_ttl,
            self.reply_protocol,
            self.reply_icmp_type,
            self.reply_icmp_code,
            labels,
            self.probe_dst_addr,
            self.probe_size,
            self.probe_ttl_l3,
            self.probe_protocol,
            self.probe_src_port,
            self.probe_dst_port,
            self.probe_ttl_l4,
            self.rtt,
            self.round,
            u8::from(self.success),
        )
    }

    /// Parse a reply row produced by [`Reply::to_csv`].
    pub fn from_csv(line: &str) -> Result<Self, CsvError> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 19 {
            return Err(CsvError::FieldCount {
                expected: "19",
                found: fields.len(),
            });
        }

        fn field<T: std::str::FromStr>(
            value: &str,
            name: &'static str,
        ) -> Result<T, CsvError> {
            value.parse().map_err(|_| CsvError::InvalidField {
                field: name,
                reason: format!("'{value}'"),
            })
        }

        let reply_mpls_labels = if fields[8].is_empty() {
            Vec::new()
        } else {
            fields[8]
                .split('|')
                .map(|l| field::<u32>(l, "reply_mpls_labels"))
                .collect::<Result<_, _>>()?
        };

        Ok(Self {
            capture_timestamp: field(fields[0], "capture_timestamp")?,
            reply_src_addr: field(fields[1], "reply_src_addr")?,
            reply_dst_addr: field(fields[2], "reply_dst_addr")?,
            reply_size: field(fields[3], "reply_size")?,
            reply_ttl: field(fields[4], "reply_ttl")?,
            reply_protocol: field(fields[5], "reply_protocol")?,
            reply_icmp_type: field(fields[6], "reply_icmp_type")?,
            reply_icmp_code: field(fields[7], "reply_icmp_code")?,
            reply_mpls_labels,
            probe_dst_addr: field(fields[9], "probe_dst_addr")?,
            probe_size: field(fields[10], "probe_size")?,
            probe_ttl_l3: field(fields[11], "probe_ttl_l3")?,
            probe_protocol: field(fields[12], "probe_protocol")?,
            probe_src_port: field(fields[13], "probe_src_port")?,
            probe_dst_port: field(fields[14], "probe_dst_port")?,
            probe_ttl_l4: field(fields[15], "probe_ttl_l4")?,
            rtt: field(fields[16], "rtt")?,
            round: fields[17].to_string(),
            success: fields[18] == "1",
        })
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} icmp={}/{} probe={}@{} rtt={:.1}ms",
            self.reply_src_addr,
            self.reply_dst_addr,
            self.reply_icmp_type,
            self.reply_icmp_code,
            self.probe_dst_addr,
            self.probe_ttl_l3,
            self.rtt,
        )
    }
}
