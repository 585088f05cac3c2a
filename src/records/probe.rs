//! Probe records: one send intent per CSV line.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::config::Protocol;
use crate::error::CsvError;

/// A send intent: destination, ports, TTL and transport protocol.
///
/// For ICMP/ICMPv6 probes the destination port is ignored and the source
/// port doubles as the flow identifier carried in the id and checksum
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
    pub protocol: Protocol,
}

impl Probe {
    /// Parse `dst_addr,src_port,dst_port,ttl,protocol`.
    pub fn from_csv(line: &str) -> Result<Self, CsvError> {
        Self::parse(line, None)
    }

    /// Parse a probe line whose protocol column is optional, falling back to
    /// `default_protocol` for the older 4-column format.
    pub fn from_csv_with_default(
        line: &str,
        default_protocol: Protocol,
    ) -> Result<Self, CsvError> {
        Self::parse(line, Some(default_protocol))
    }

    fn parse(line: &str, default_protocol: Option<Protocol>) -> Result<Self, CsvError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let protocol = match (fields.len(), default_protocol) {
            (5, _) => fields[4]
                .parse::<Protocol>()
                .map_err(|reason| CsvError::InvalidField {
                    field: "protocol",
                    reason,
                })?,
            (4, Some(default)) => default,
            (found, _) => {
                return Err(CsvError::FieldCount {
                    expected: "5 (dst_addr,src_port,dst_port,ttl,protocol)",
                    found,
                })
            }
        };
        let dst_addr: IpAddr = fields[0].parse().map_err(|_| CsvError::InvalidField {
            field: "dst_addr",
            reason: format!("'{}' is not an IP address", fields[0]),
        })?;
        let src_port: u16 = fields[1].parse().map_err(|_| CsvError::InvalidField {
            field: "src_port",
            reason: format!("'{}' is not a port number", fields[1]),
        })?;
        let dst_port: u16 = fields[2].parse().map_err(|_| CsvError::InvalidField {
            field: "dst_port",
            reason: format!("'{}' is not a port number", fields[2]),
        })?;
        let ttl: u8 = fields[3]
            .parse()
            .ok()
            .filter(|&t| t >= 1)
            .ok_or_else(|| CsvError::InvalidField {
                field: "ttl",
                reason: format!("'{}' is not a TTL in 1-255", fields[3]),
            })?;

        let probe = Self {
            dst_addr,
            src_port,
            dst_port,
            ttl,
            protocol,
        };
        probe.check_family()?;
        Ok(probe)
    }

    fn check_family(&self) -> Result<(), CsvError> {
        match (self.protocol, self.dst_addr) {
            (Protocol::Icmp, IpAddr::V6(_)) => Err(CsvError::AddressFamilyMismatch {
                protocol: "icmp",
                family: "IPv4",
            }),
            (Protocol::Icmp6, IpAddr::V4(_)) => Err(CsvError::AddressFamilyMismatch {
                protocol: "icmp6",
                family: "IPv6",
            }),
            _ => Ok(()),
        }
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.dst_addr, self.src_port, self.dst_port, self.ttl, self.protocol
        )
    }

    /// The 16-bit flow identifier encoded into the transport checksum.
    pub fn flow_id(&self) -> u16 {
        self.src_port
    }

    pub fn is_ipv4(&self) -> bool {
        self.dst_addr.is_ipv4()
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}/{}",
            self.dst_addr, self.src_port, self.dst_port, self.ttl, self.protocol
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_from_csv() {
        let probe = Probe::from_csv("192.0.2.1,24000,33434,8,udp").unwrap();
        assert_eq!(probe.dst_addr, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(probe.src_port, 24000);
        assert_eq!(probe.dst_port, 33434);
        assert_eq!(probe.ttl, 8);
        assert_eq!(probe.protocol, Protocol::Udp);
    }

    #[test]
    fn test_from_csv_ipv6() {
        let probe = Probe::from_csv("2001:db8::1,24500,0,3,icmp6").unwrap();
        assert_eq!(
            probe.dst_addr,
            IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap())
        );
        assert_eq!(probe.protocol, Protocol::Icmp6);
    }

    #[test]
    fn test_from_csv_default_protocol() {
        let probe =
            Probe::from_csv_with_default("192.0.2.1,24000,0,5", Protocol::Icmp).unwrap();
        assert_eq!(probe.protocol, Protocol::Icmp);
        // An explicit column still wins.
        let probe =
            Probe::from_csv_with_default("192.0.2.1,24000,33434,5,udp", Protocol::Icmp).unwrap();
        assert_eq!(probe.protocol, Protocol::Udp);
    }

    #[test]
    fn test_from_csv_rejects_malformed() {
        assert!(Probe::from_csv("not-an-ip,1,2,3,udp").is_err());
        assert!(Probe::from_csv("192.0.2.1,99999,2,3,udp").is_err());
        assert!(Probe::from_csv("192.0.2.1,1,2,0,udp").is_err(), "zero TTL");
        assert!(Probe::from_csv("192.0.2.1,1,2,300,udp").is_err());
        assert!(Probe::from_csv("192.0.2.1,1,2,3,tcp").is_err());
        assert!(Probe::from_csv("192.0.2.1,1,2").is_err());
        assert!(
            Probe::from_csv("192.0.2.1,24000,0,5").is_err(),
            "4-column form needs a default protocol"
        );
    }

    #[test]
    fn test_from_csv_rejects_family_mismatch() {
        assert!(Probe::from_csv("2001:db8::1,1,0,3,icmp").is_err());
        assert!(Probe::from_csv("192.0.2.1,1,0,3,icmp6").is_err());
    }

    #[test]
    fn test_csv_round_trip() {
        for line in [
            "192.0.2.1,24000,0,1,icmp",
            "198.51.100.10,33000,33435,5,udp",
            "2001:db8::1,24500,0,3,icmp6",
        ] {
            let probe = Probe::from_csv(line).unwrap();
            assert_eq!(probe.to_csv(), line);
            assert_eq!(Probe::from_csv(&probe.to_csv()).unwrap(), probe);
        }
    }

    #[test]
    fn test_flow_id_is_source_port() {
        let probe = Probe::from_csv("192.0.2.1,24000,0,1,icmp").unwrap();
        assert_eq!(probe.flow_id(), 24000);
    }
}
