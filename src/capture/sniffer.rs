//! Background capture of ICMP replies.
//!
//! The sniffer owns the capture handle, the reply CSV writer and the
//! optional PCAP pass-through; they live on its thread's stack, so they are
//! released on every exit path, parser panics included. Only the sniffer
//! thread mutates its statistics; everyone else reads snapshots.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{error, info, trace, warn};
use pcap::{Active, Capture, Savefile};
use tokio_util::sync::CancellationToken;

use crate::stats::{SnifferSnapshot, SnifferStatistics};

use super::parser::Parser;
use super::link_layer;

const IPPROTO_UDP: u8 = 17;

/// Capture only what can be a reply to one of our probes: echo replies,
/// time-exceeded and destination-unreachable. For IPv4 errors the quoted
/// packet is inspected in-kernel: `icmp[17]` is the quoted protocol and
/// `icmp[30:2]` the quoted destination port (a 20-byte quoted header).
/// Classic BPF cannot dereference that deep behind `icmp6`, so the IPv6 side
/// filters on type only and the parser applies the port sentinel.
fn bpf_filter(destination_port_floor: u16) -> String {
    format!(
        "(icmp and (icmp[0] = 0 or ((icmp[0] = 11 or icmp[0] = 3) and \
         (icmp[17] = 1 or (icmp[17] = 17 and icmp[30:2] >= {floor}))))) or \
         (icmp6 and (icmp6[0] = 129 or icmp6[0] = 3 or icmp6[0] = 1))",
        floor = destination_port_floor
    )
}

/// A running capture thread.
pub struct Sniffer {
    handle: thread::JoinHandle<()>,
    cancel: CancellationToken,
    statistics: Arc<SnifferStatistics>,
}

impl Sniffer {
    /// Open the capture and spawn the thread. Everything that can fail at
    /// startup (device, permissions, filter, output files) fails here,
    /// before any packet is sent.
    pub fn start(
        interface: &str,
        output_csv: &Path,
        output_pcap: Option<&Path>,
        meta_round: &str,
        destination_port_floor: u16,
    ) -> Result<Self> {
        let mut capture = Capture::from_device(interface)
            .with_context(|| format!("opening capture device '{interface}'"))?
            .promisc(true)
            .immediate_mode(true)
            .buffer_size(16 * 1024 * 1024)
            .timeout(100)
            .open()
            .with_context(|| {
                format!("activating capture on '{interface}' (requires CAP_NET_RAW or root)")
            })?;
        let filter = bpf_filter(destination_port_floor);
        capture
            .filter(&filter, true)
            .with_context(|| format!("installing BPF filter '{filter}'"))?;
        let parser = Parser::new(link_layer(capture.get_datalink())?);

        let csv = BufWriter::new(File::create(output_csv).with_context(|| {
            format!("creating reply output file {}", output_csv.display())
        })?);
        let savefile = match output_pcap {
            Some(path) => Some(capture.savefile(path).with_context(|| {
                format!("creating PCAP output file {}", path.display())
            })?),
            None => None,
        };

        let cancel = CancellationToken::new();
        let statistics = Arc::new(SnifferStatistics::default());
        let handle = {
            let cancel = cancel.clone();
            let statistics = statistics.clone();
            let round = meta_round.to_string();
            thread::spawn(move || {
                run_capture_loop(
                    capture,
                    parser,
                    csv,
                    savefile,
                    statistics,
                    cancel,
                    round,
                    destination_port_floor,
                );
            })
        };

        Ok(Self {
            handle,
            cancel,
            statistics,
        })
    }

    pub fn statistics(&self) -> Arc<SnifferStatistics> {
        self.statistics.clone()
    }

    /// Signal the capture loop to exit and wait for it to flush and close
    /// its outputs.
    pub fn stop(self) -> SnifferSnapshot {
        self.cancel.cancel();
        if self.handle.join().is_err() {
            warn!("sniffer thread panicked; outputs were closed during unwind");
        }
        self.statistics.snapshot()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture_loop(
    mut capture: Capture<Active>,
    parser: Parser,
    mut csv: BufWriter<File>,
    mut savefile: Option<Savefile>,
    statistics: Arc<SnifferStatistics>,
    cancel: CancellationToken,
    round: String,
    destination_port_floor: u16,
) {
    while !cancel.is_cancelled() {
        match capture.next_packet() {
            Ok(frame) => {
                statistics.record_received();
                if let Some(savefile) = savefile.as_mut() {
                    savefile.write(&frame);
                }
                let timestamp_us = frame.header.ts.tv_sec as u64 * 1_000_000
                    + frame.header.ts.tv_usec as u64;
                match parser.parse(frame.data, timestamp_us) {
                    Ok(mut reply) => {
                        // The kernel filter cannot check quoted IPv6 ports.
                        if reply.probe_protocol == IPPROTO_UDP
                            && reply.probe_dst_port < destination_port_floor
                        {
                            statistics.record_invalid();
                            trace!("frame dropped: quoted port {} below sentinel", reply.probe_dst_port);
                            continue;
                        }
                        reply.round = round.clone();
                        statistics.record_reply(&reply);
                        trace!("reply={reply}");
                        if let Err(e) = writeln!(csv, "{}", reply.to_csv()) {
                            error!("failed to write reply row: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        statistics.record_invalid();
                        trace!("frame dropped: {e}");
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!("capture error, stopping sniffer: {e}");
                }
                break;
            }
        }
    }

    if let Err(e) = csv.flush() {
        error!("failed to flush reply output: {e}");
    }
    if let Some(savefile) = savefile.as_mut() {
        if let Err(e) = savefile.flush() {
            error!("failed to flush PCAP output: {e}");
        }
    }
    info!("sniffer stopped: {}", statistics.snapshot());
}
