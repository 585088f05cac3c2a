use std::path::PathBuf;

use clap::Parser;

/// High-rate traceroute prober: reads probe specifications, emits crafted
/// ICMP/ICMPv6/UDP packets at a paced rate, and writes matched replies as CSV
#[derive(Parser, Debug, Clone)]
#[command(name = "hopstorm")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Interface to send probes from and capture replies on
    /// (default: first usable non-loopback interface)
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Default protocol for probe lines without a protocol column
    /// (icmp, icmp6, udp)
    #[arg(short = 'p', long = "protocol", default_value = "icmp")]
    pub protocol: String,

    /// Target probing rate in packets per second (0 = unpaced)
    #[arg(short = 'r', long = "probing-rate", default_value = "100")]
    pub probing_rate: u64,

    /// Number of packets between two rate limiter invocations
    #[arg(long = "batch-size", default_value = "128")]
    pub batch_size: u64,

    /// Rate limiting method (auto, active, sleep)
    #[arg(long = "rate-limiting-method", default_value = "auto")]
    pub rate_limiting_method: String,

    /// File of probes to send, one `dst_addr,src_port,dst_port,ttl[,protocol]`
    /// per line; reads stdin when omitted
    #[arg(short = 'I', long = "input-file")]
    pub input_file: Option<PathBuf>,

    /// File to write the reply rows to
    #[arg(short = 'o', long = "output-file-csv", default_value = "replies.csv")]
    pub output_file_csv: PathBuf,

    /// Also write every sniffed frame verbatim to this PCAP file
    #[arg(long = "output-file-pcap")]
    pub output_file_pcap: Option<PathBuf>,

    /// File of prefixes never to probe (CIDR per line, `#` comments)
    #[arg(long = "prefix-excl-file")]
    pub prefix_excl_file: Option<PathBuf>,

    /// If set, probe only destinations covered by these prefixes
    #[arg(long = "prefix-incl-file")]
    pub prefix_incl_file: Option<PathBuf>,

    /// Drop probes with a TTL below this value
    #[arg(long = "filter-min-ttl")]
    pub filter_min_ttl: Option<u8>,

    /// Drop probes with a TTL above this value
    #[arg(long = "filter-max-ttl")]
    pub filter_max_ttl: Option<u8>,

    /// Number of copies to send for each probe
    #[arg(short = 'N', long = "n-packets", default_value = "1")]
    pub n_packets: u64,

    /// Stop probing after this many packets have been sent
    #[arg(long = "max-probes")]
    pub max_probes: Option<u64>,

    /// Seconds to keep the sniffer running after the last probe, so
    /// in-flight replies can land
    #[arg(short = 'W', long = "sniffer-wait-time", default_value = "5")]
    pub sniffer_wait_time: u64,

    /// Opaque tag attached to every reply row (must not contain commas)
    #[arg(long = "meta-round", default_value = "1")]
    pub meta_round: String,

    /// Parse an existing PCAP file into reply rows instead of probing
    #[arg(long = "read-pcap", value_name = "PCAP")]
    pub read_pcap: Option<PathBuf>,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        let protocol = self.protocol.to_lowercase();
        if !["icmp", "icmp6", "udp"].contains(&protocol.as_str()) {
            return Err(format!(
                "Unknown protocol: {}. Use icmp, icmp6, or udp",
                self.protocol
            ));
        }

        let method = self.rate_limiting_method.to_lowercase();
        if !["auto", "active", "sleep"].contains(&method.as_str()) {
            return Err(format!(
                "Unknown rate limiting method: {}. Use auto, active, or sleep",
                self.rate_limiting_method
            ));
        }

        if self.batch_size == 0 {
            return Err("Batch size must be at least 1".into());
        }

        if self.n_packets == 0 {
            return Err("Number of packets per probe must be at least 1".into());
        }

        if let (Some(min), Some(max)) = (self.filter_min_ttl, self.filter_max_ttl) {
            if min > max {
                return Err(format!(
                    "filter-min-ttl ({min}) cannot exceed filter-max-ttl ({max})"
                ));
            }
        }

        if self.meta_round.contains(',') {
            return Err("meta-round cannot contain commas".into());
        }

        // Validate interface name
        if let Some(ref iface) = self.interface {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!(
                    "Interface name too long: {iface} (max 15 chars)"
                ));
            }
        }

        Ok(())
    }
}
