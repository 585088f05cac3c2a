//! Network interface discovery for the sender and sniffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, Result};
use pnet::datalink;

/// Check if an IPv6 address is link-local (fe80::/10).
///
/// Link-local addresses need scope identifiers and cannot source probes
/// toward Internet targets.
pub fn is_link_local_ipv6(addr: &Ipv6Addr) -> bool {
    let first_segment = addr.segments()[0];
    (0xfe80..=0xfebf).contains(&first_segment)
}

/// A usable interface and the source addresses probes will carry.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    /// First global IPv4 address on the interface, if any.
    pub ipv4: Option<Ipv4Addr>,
    /// First global IPv6 address on the interface, if any.
    pub ipv6: Option<Ipv6Addr>,
}

fn info_from(iface: &datalink::NetworkInterface) -> InterfaceInfo {
    let mut ipv4 = None;
    let mut ipv6 = None;
    let is_loopback = iface.is_loopback();

    for addr in &iface.ips {
        match addr.ip() {
            IpAddr::V4(v4) if ipv4.is_none() && !v4.is_loopback() => {
                ipv4 = Some(v4);
            }
            IpAddr::V6(v6) if ipv6.is_none() && !v6.is_loopback() => {
                if !is_link_local_ipv6(&v6) {
                    ipv6 = Some(v6);
                }
            }
            _ => {}
        }
    }

    // On the loopback interface itself, loopback addresses are the point.
    if is_loopback && ipv4.is_none() && ipv6.is_none() {
        for addr in &iface.ips {
            match addr.ip() {
                IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(v4),
                IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(v6),
                _ => {}
            }
        }
    }

    InterfaceInfo {
        name: iface.name.clone(),
        index: iface.index,
        ipv4,
        ipv6,
    }
}

/// Look an interface up by name.
pub fn find_interface(name: &str) -> Result<InterfaceInfo> {
    for iface in datalink::interfaces() {
        if iface.name == name {
            let info = info_from(&iface);
            if info.ipv4.is_none() && info.ipv6.is_none() {
                return Err(anyhow!(
                    "interface '{name}' has no usable source address \
                     (link-local IPv6 does not count)"
                ));
            }
            return Ok(info);
        }
    }

    let available: Vec<_> = datalink::interfaces()
        .iter()
        .filter(|i| !i.ips.is_empty())
        .map(|i| i.name.clone())
        .collect();
    Err(anyhow!(
        "interface '{name}' not found. Available interfaces: {}",
        if available.is_empty() {
            "(none with IP addresses)".to_string()
        } else {
            available.join(", ")
        }
    ))
}

/// The first up, non-loopback interface with a usable address.
pub fn default_interface() -> Result<InterfaceInfo> {
    datalink::interfaces()
        .iter()
        .filter(|i| i.is_up() && !i.is_loopback() && !i.ips.is_empty())
        .map(info_from)
        .find(|info| info.ipv4.is_some() || info.ipv6.is_some())
        .ok_or_else(|| anyhow!("no usable non-loopback interface found"))
}
