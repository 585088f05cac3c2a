//! Typed errors for the hot paths.
//!
//! Startup errors use `anyhow` with context; everything that can fire per
//! packet or per CSV line gets a concrete type here so callers can count and
//! drop without string inspection.

use thiserror::Error;

/// A value does not fit in the requested narrower type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("value {value} is out of range for {target}")]
pub struct RangeError {
    pub value: String,
    pub target: &'static str,
}

/// Misuse of the packet buffer or builders. These are programming bugs and
/// surface as hard failures rather than being silently truncated.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("buffer of {available} bytes cannot hold a {required} byte packet")]
    BufferTooSmall { required: usize, available: usize },
    #[error("the payload must be at least {required} bytes long to allow for a custom checksum, got {available}")]
    PayloadTooSmall { required: usize, available: usize },
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// A probe could not be transmitted. Counted as `failed`; the loop continues.
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("no {family} source address on the probing interface")]
    NoSourceAddress { family: &'static str },
    #[error("{protocol} probes cannot be sent to an {family} destination")]
    ProtocolMismatch {
        protocol: &'static str,
        family: &'static str,
    },
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A captured frame is not a reply to one of our probes.
/// Logged at trace level and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotAMatch {
    #[error("frame truncated at {0} bytes")]
    Truncated(usize),
    #[error("unsupported link layer framing")]
    UnsupportedLinkLayer,
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("invalid outer header checksum")]
    InvalidChecksum,
    #[error("malformed quoted packet")]
    MalformedQuote,
    #[error("unexpected ICMP type {0}")]
    UnexpectedIcmpType(u8),
    #[error("recovered TTL {0} is out of range")]
    TtlOutOfRange(u16),
}

/// A malformed CSV record. Probe lines are warned about and skipped;
/// reply lines surface to the caller.
#[derive(Error, Debug)]
pub enum CsvError {
    #[error("expected {expected} fields, got {found}")]
    FieldCount { expected: &'static str, found: usize },
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{protocol} probes require an {family} destination")]
    AddressFamilyMismatch {
        protocol: &'static str,
        family: &'static str,
    },
}
