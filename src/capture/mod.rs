//! Reply capture: live sniffing, frame parsing, and offline readback.

pub mod parser;
pub mod reader;
pub mod sniffer;

pub use parser::*;
pub use reader::*;
pub use sniffer::*;

use anyhow::{bail, Result};
use pcap::Linktype;

use crate::packet::L2;

/// Lowest destination port the prober targets; quoted ports below it cannot
/// belong to one of our UDP probes (classic traceroute sentinel).
pub const DESTINATION_PORT_FLOOR: u16 = 33434;

/// Map a capture handle's link type onto the framing the parser understands.
pub(crate) fn link_layer(linktype: Linktype) -> Result<L2> {
    match linktype {
        Linktype::ETHERNET => Ok(L2::Ethernet),
        Linktype::NULL | Linktype::LOOP => Ok(L2::Loopback),
        Linktype::RAW => Ok(L2::None),
        other => bail!("unsupported capture link type {:?}", other),
    }
}
