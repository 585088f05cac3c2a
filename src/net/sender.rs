//! Raw sockets for emitting crafted probe packets.
//!
//! One L3 socket per address family, opened at construction with header
//! inclusion enabled so the kernel transmits our IP header as written. The
//! packet is crafted into a buffer that is reused across probes; a single
//! sender thread is assumed.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol as SocketProtocol, SockAddr, Socket, Type};

use crate::config::Protocol;
use crate::error::SendError;
use crate::packet::{
    build_icmp, build_icmpv6, build_ipv4, build_ipv6, build_udp, encode_timestamp, Packet, L2,
    L3, L4, PAYLOAD_TWEAK_BYTES, PROBE_PAYLOAD_BASE,
};
use crate::records::Probe;

use super::interface::{find_interface, InterfaceInfo};

/// Something that can transmit probes. The probing loop is generic over this
/// so it can run against a recording sink in tests.
pub trait ProbeSink {
    fn send(&mut self, probe: &Probe) -> Result<usize, SendError>;
}

pub struct Sender {
    socket_v4: Socket,
    socket_v6: Socket,
    interface: InterfaceInfo,
    buffer: Vec<u8>,
}

impl Sender {
    /// Open raw sockets on `interface`. Fails fast on missing privileges so
    /// startup errors surface before any thread is spawned.
    pub fn new(interface: &str) -> Result<Self> {
        let info = find_interface(interface)?;
        let socket_v4 = open_raw_socket(Domain::IPV4)
            .context("opening IPv4 raw socket (requires CAP_NET_RAW or root)")?;
        enable_header_included(&socket_v4, false)
            .context("enabling IP_HDRINCL on the IPv4 raw socket")?;
        let socket_v6 = open_raw_socket(Domain::IPV6)
            .context("opening IPv6 raw socket (requires CAP_NET_RAW or root)")?;
        enable_header_included(&socket_v6, true)
            .context("enabling IPV6_HDRINCL on the IPv6 raw socket")?;
        bind_to_device(&socket_v4, &info)?;
        bind_to_device(&socket_v6, &info)?;
        Ok(Self {
            socket_v4,
            socket_v6,
            interface: info,
            buffer: vec![0u8; 512],
        })
    }

    fn build_and_send(&mut self, probe: &Probe) -> Result<usize, SendError> {
        let timestamp = encode_timestamp(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        );

        let total_size = match probe.dst_addr {
            IpAddr::V4(dst) => {
                let src = self.interface.ipv4.ok_or(SendError::NoSourceAddress {
                    family: "IPv4",
                })?;
                let l4 = match probe.protocol {
                    Protocol::Icmp => L4::Icmp,
                    Protocol::Udp => L4::Udp,
                    Protocol::Icmp6 => {
                        return Err(SendError::ProtocolMismatch {
                            protocol: "icmp6",
                            family: "IPv4",
                        })
                    }
                };
                let mut packet =
                    Packet::new(&mut self.buffer, L2::None, L3::Ipv4, l4, PROBE_PAYLOAD_BASE)?;
                packet.payload_mut()[PAYLOAD_TWEAK_BYTES..PROBE_PAYLOAD_BASE]
                    .copy_from_slice(&timestamp.to_be_bytes());
                build_ipv4(&mut packet, src, dst, probe.ttl)?;
                match probe.protocol {
                    Protocol::Icmp => {
                        build_icmp(&mut packet, probe.flow_id(), u16::from(probe.ttl))?
                    }
                    _ => build_udp(
                        &mut packet,
                        probe.src_port,
                        probe.dst_port,
                        Some(probe.flow_id()),
                    )?,
                }
                packet.total_size()
            }
            IpAddr::V6(dst) => {
                let src = self.interface.ipv6.ok_or(SendError::NoSourceAddress {
                    family: "IPv6",
                })?;
                let l4 = match probe.protocol {
                    Protocol::Icmp6 => L4::Icmpv6,
                    Protocol::Udp => L4::Udp,
                    Protocol::Icmp => {
                        return Err(SendError::ProtocolMismatch {
                            protocol: "icmp",
                            family: "IPv6",
                        })
                    }
                };
                // The payload pads out so the payload length encodes the TTL.
                let payload_size = PROBE_PAYLOAD_BASE + usize::from(probe.ttl);
                let mut packet =
                    Packet::new(&mut self.buffer, L2::None, L3::Ipv6, l4, payload_size)?;
                packet.payload_mut()[PAYLOAD_TWEAK_BYTES..PROBE_PAYLOAD_BASE]
                    .copy_from_slice(&timestamp.to_be_bytes());
                build_ipv6(&mut packet, src, dst, probe.ttl)?;
                match probe.protocol {
                    Protocol::Icmp6 => {
                        build_icmpv6(&mut packet, probe.flow_id(), u16::from(probe.ttl))?
                    }
                    _ => build_udp(
                        &mut packet,
                        probe.src_port,
                        probe.dst_port,
                        Some(probe.flow_id()),
                    )?,
                }
                packet.total_size()
            }
        };

        let socket = if probe.is_ipv4() {
            &self.socket_v4
        } else {
            &self.socket_v6
        };
        let destination = SockAddr::from(SocketAddr::new(probe.dst_addr, 0));
        let sent = socket.send_to(&self.buffer[..total_size], &destination)?;
        Ok(sent)
    }
}

impl ProbeSink for Sender {
    fn send(&mut self, probe: &Probe) -> Result<usize, SendError> {
        self.build_and_send(probe)
    }
}

fn open_raw_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::RAW, Some(SocketProtocol::from(libc::IPPROTO_RAW)))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Tell the kernel the buffers we hand it start at the IP header.
fn enable_header_included(socket: &Socket, ipv6: bool) -> io::Result<()> {
    let (level, option) = if ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_HDRINCL)
    } else {
        (libc::IPPROTO_IP, libc::IP_HDRINCL)
    };
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, info: &InterfaceInfo) -> Result<()> {
    socket
        .bind_device(Some(info.name.as_bytes()))
        .with_context(|| format!("binding raw socket to interface '{}'", info.name))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, info: &InterfaceInfo) -> Result<()> {
    // Raw L3 sends route by destination; device binding is a Linux nicety.
    log::debug!(
        "device binding not supported on this platform; relying on routing for '{}'",
        info.name
    );
    Ok(())
}
