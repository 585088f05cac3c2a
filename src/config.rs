use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::net::default_interface;

/// Probe transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Icmp,
    Icmp6,
    Udp,
}

impl Protocol {
    /// IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Icmp6 => 58,
            Protocol::Udp => 17,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Icmp6 => "icmp6",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icmp" => Ok(Protocol::Icmp),
            "icmp6" => Ok(Protocol::Icmp6),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}. Use icmp, icmp6, or udp")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the rate limiter burns the residual of each batch interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitingMethod {
    /// Sleep until within one clock-resolution margin, then spin.
    #[default]
    Auto,
    /// Spin on a monotonic clock.
    Active,
    /// Block in an OS sleep.
    Sleep,
}

impl FromStr for RateLimitingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(RateLimitingMethod::Auto),
            "active" => Ok(RateLimitingMethod::Active),
            "sleep" => Ok(RateLimitingMethod::Sleep),
            other => Err(format!(
                "unknown rate limiting method: {other}. Use auto, active, or sleep"
            )),
        }
    }
}

impl fmt::Display for RateLimitingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateLimitingMethod::Auto => "auto",
            RateLimitingMethod::Active => "active",
            RateLimitingMethod::Sleep => "sleep",
        };
        f.write_str(s)
    }
}

/// Runtime configuration derived from CLI args.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// NIC used for both sending and capturing.
    pub interface: String,
    /// Default L4 protocol for probe lines without a protocol column.
    pub protocol: Protocol,
    /// Target probing rate in packets per second (0 = unpaced).
    pub probing_rate: u64,
    /// Packets between two rate limiter invocations.
    pub batch_size: u64,
    pub rate_limiting_method: RateLimitingMethod,
    /// Probe CSV input (None = stdin).
    pub input_file: Option<PathBuf>,
    /// Reply CSV output.
    pub output_file_csv: PathBuf,
    /// Optional verbatim PCAP copy of every sniffed frame.
    pub output_file_pcap: Option<PathBuf>,
    /// Prefixes never to probe (deny list).
    pub prefix_excl_file: Option<PathBuf>,
    /// If set, only probe these prefixes (allow list).
    pub prefix_incl_file: Option<PathBuf>,
    pub filter_min_ttl: Option<u8>,
    pub filter_max_ttl: Option<u8>,
    /// Copies sent per probe.
    pub n_packets: u64,
    /// Stop after this many packets have been sent.
    pub max_probes: Option<u64>,
    /// Seconds to keep capturing after the last probe.
    pub sniffer_wait_time: u64,
    /// Opaque tag stamped on every reply row.
    pub meta_round: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            protocol: Protocol::Icmp,
            probing_rate: 100,
            batch_size: 128,
            rate_limiting_method: RateLimitingMethod::Auto,
            input_file: None,
            output_file_csv: PathBuf::from("replies.csv"),
            output_file_pcap: None,
            prefix_excl_file: None,
            prefix_incl_file: None,
            filter_min_ttl: None,
            filter_max_ttl: None,
            n_packets: 1,
            max_probes: None,
            sniffer_wait_time: 5,
            meta_round: "1".to_string(),
        }
    }
}

impl Config {
    /// Build the runtime configuration, resolving the capture interface when
    /// none was given. The enum strings have already been checked by
    /// `Args::validate`.
    pub fn from_args(args: &Args) -> Result<Self> {
        let interface = match &args.interface {
            Some(name) => name.clone(),
            None => default_interface()?.name,
        };
        let protocol = args.protocol.parse().map_err(anyhow::Error::msg)?;
        let rate_limiting_method = args
            .rate_limiting_method
            .parse()
            .map_err(anyhow::Error::msg)?;
        Ok(Self {
            interface,
            protocol,
            probing_rate: args.probing_rate,
            batch_size: args.batch_size,
            rate_limiting_method,
            input_file: args.input_file.clone(),
            output_file_csv: args.output_file_csv.clone(),
            output_file_pcap: args.output_file_pcap.clone(),
            prefix_excl_file: args.prefix_excl_file.clone(),
            prefix_incl_file: args.prefix_incl_file.clone(),
            filter_min_ttl: args.filter_min_ttl,
            filter_max_ttl: args.filter_max_ttl,
            n_packets: args.n_packets,
            max_probes: args.max_probes,
            sniffer_wait_time: args.sniffer_wait_time,
            meta_round: args.meta_round.clone(),
        })
    }
}
