//! Offline conversion of capture files into reply rows.
//!
//! Replays a PCAP through the same parser the live sniffer uses, so a
//! diagnostic capture taken with `--output-file-pcap` (or any external
//! capture) can be turned into the reply CSV after the fact.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, trace};

use crate::stats::{SnifferSnapshot, SnifferStatistics};

use super::link_layer;
use super::parser::Parser;

/// Parse every frame of `input` and append the matched replies to `output`,
/// tagged with `meta_round`. Returns the capture statistics.
pub fn read(input: &Path, output: &Path, meta_round: &str) -> Result<SnifferSnapshot> {
    let mut capture = pcap::Capture::from_file(input)
        .with_context(|| format!("opening capture file {}", input.display()))?;
    let parser = Parser::new(link_layer(capture.get_datalink())?);
    let mut csv = BufWriter::new(File::create(output).with_context(|| {
        format!("creating reply output file {}", output.display())
    })?);
    let statistics = SnifferStatistics::default();

    loop {
        match capture.next_packet() {
            Ok(frame) => {
                if statistics.received_count() % 1_000_000 == 0
                    && statistics.received_count() > 0
                {
                    info!("{}", statistics.snapshot());
                }
                statistics.record_received();
                let timestamp_us = frame.header.ts.tv_sec as u64 * 1_000_000
                    + frame.header.ts.tv_usec as u64;
                match parser.parse(frame.data, timestamp_us) {
                    Ok(mut reply) => {
                        reply.round = meta_round.to_string();
                        statistics.record_reply(&reply);
                        writeln!(csv, "{}", reply.to_csv())
                            .context("writing reply row")?;
                    }
                    Err(e) => {
                        statistics.record_invalid();
                        trace!("frame dropped: {e}");
                    }
                }
            }
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(e).context("reading capture file"),
        }
    }

    csv.flush().context("flushing reply output")?;
    let snapshot = statistics.snapshot();
    info!("{snapshot}");
    Ok(snapshot)
}
