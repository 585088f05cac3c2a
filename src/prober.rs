//! The probing loop: read, filter, pace, send.
//!
//! Three long-lived threads cooperate here: this loop, the sniffer's capture
//! thread, and a detached reporter that prints statistics every five
//! seconds. The sniffer starts strictly before the first send so early
//! replies are not lost, and is stopped only after `sniffer_wait_time`
//! seconds past the last send so in-flight replies can land, on every exit
//! path including panics.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, trace, warn};
use scopeguard::ScopeGuard;

use crate::capture::{Sniffer, DESTINATION_PORT_FLOOR};
use crate::config::Config;
use crate::lpm::PrefixSet;
use crate::net::{ProbeSink, Sender};
use crate::ratelimit::RateLimiter;
use crate::records::Probe;
use crate::stats::{ProberSnapshot, ProberStatistics, SnifferSnapshot};

/// Final counters from both sides of a probing run.
pub type ProbingStatistics = (ProberSnapshot, SnifferSnapshot);

/// Send every probe the iterator yields, capturing replies concurrently.
pub fn probe<I>(config: &Config, probes: I) -> Result<ProbingStatistics>
where
    I: IntoIterator<Item = Probe>,
{
    info!("config={config:?}");

    let prefix_excl = load_prefixes(config.prefix_excl_file.as_deref(), "excluded")?;
    let prefix_incl = load_prefixes(config.prefix_incl_file.as_deref(), "included")?;

    let sniffer = Sniffer::start(
        &config.interface,
        &config.output_file_csv,
        config.output_file_pcap.as_deref(),
        &config.meta_round,
        DESTINATION_PORT_FLOOR,
    )?;
    // Stop the sniffer on every exit path, panics included; the normal path
    // defuses the guard to collect the statistics.
    let sniffer = scopeguard::guard(sniffer, |sniffer| {
        sniffer.stop();
    });

    let mut sender = Sender::new(&config.interface)?;
    let mut rate_limiter = RateLimiter::new(
        config.probing_rate,
        config.batch_size,
        config.rate_limiting_method,
    );

    let statistics = Arc::new(ProberStatistics::default());
    spawn_reporter(
        statistics.clone(),
        sniffer.statistics(),
        rate_limiter.statistics(),
    );

    run_loop(
        config,
        probes,
        &mut sender,
        prefix_excl.as_ref(),
        prefix_incl.as_ref(),
        &mut rate_limiter,
        &statistics,
    );

    info!(
        "waiting {}s to allow the sniffer to catch the last in-flight replies...",
        config.sniffer_wait_time
    );
    thread::sleep(Duration::from_secs(config.sniffer_wait_time));
    let sniffer_snapshot = ScopeGuard::into_inner(sniffer).stop();
    let prober_snapshot = statistics.snapshot();

    info!("{}", rate_limiter.snapshot());
    info!("{prober_snapshot}");
    info!("{sniffer_snapshot}");
    Ok((prober_snapshot, sniffer_snapshot))
}

/// Send probes from a CSV stream (e.g. stdin). Malformed lines are warned
/// about and skipped.
pub fn probe_from_reader<R: BufRead>(config: &Config, reader: R) -> Result<ProbingStatistics> {
    let default_protocol = config.protocol;
    let probes = reader.lines().filter_map(move |line| match line {
        Ok(line) => {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match Probe::from_csv_with_default(line, default_protocol) {
                Ok(probe) => Some(probe),
                Err(e) => {
                    warn!("line={line} error={e}");
                    None
                }
            }
        }
        Err(e) => {
            warn!("failed to read probe line: {e}");
            None
        }
    });
    probe(config, probes)
}

/// Send probes from a file.
pub fn probe_from_file(config: &Config, path: &Path) -> Result<ProbingStatistics> {
    if !path.exists() {
        bail!("probe input file {} does not exist", path.display());
    }
    let file = File::open(path)
        .with_context(|| format!("failed to open probe input {}", path.display()))?;
    probe_from_reader(config, BufReader::new(file))
}

/// The inner loop, generic over the sink so tests can run it without raw
/// sockets.
fn run_loop<I, S>(
    config: &Config,
    probes: I,
    sink: &mut S,
    prefix_excl: Option<&PrefixSet>,
    prefix_incl: Option<&PrefixSet>,
    rate_limiter: &mut RateLimiter,
    statistics: &ProberStatistics,
) where
    I: IntoIterator<Item = Probe>,
    S: ProbeSink,
{
    for probe in probes {
        statistics.record_read();

        if let Some(min_ttl) = config.filter_min_ttl {
            if probe.ttl < min_ttl {
                trace!("probe={probe} filter=ttl_too_low");
                statistics.record_filtered_lo_ttl();
                continue;
            }
        }
        if let Some(max_ttl) = config.filter_max_ttl {
            if probe.ttl > max_ttl {
                trace!("probe={probe} filter=ttl_too_high");
                statistics.record_filtered_hi_ttl();
                continue;
            }
        }

        // Deny list first, then the allow list.
        if let Some(excl) = prefix_excl {
            if excl.lookup(probe.dst_addr) {
                trace!("probe={probe} filter=prefix_excluded");
                statistics.record_filtered_prefix_excl();
                continue;
            }
        }
        if let Some(incl) = prefix_incl {
            if !incl.lookup(probe.dst_addr) {
                trace!("probe={probe} filter=prefix_not_included");
                statistics.record_filtered_prefix_not_incl();
                continue;
            }
        }

        for copy in 0..config.n_packets {
            trace!("probe={probe} packet={}", copy + 1);
            match sink.send(&probe) {
                Ok(_) => statistics.record_sent(),
                Err(e) => {
                    error!("probe={probe} error={e}");
                    statistics.record_failed();
                }
            }
            // Pace every `batch_size` attempted transmissions.
            if (statistics.sent() + statistics.failed()) % config.batch_size == 0 {
                rate_limiter.wait();
            }
        }

        if let Some(max_probes) = config.max_probes {
            if statistics.sent() >= max_probes {
                trace!("max_probes reached, exiting...");
                break;
            }
        }
    }
}

fn load_prefixes(path: Option<&Path>, kind: &str) -> Result<Option<PrefixSet>> {
    match path {
        Some(path) => {
            info!("loading {kind} prefixes from {}...", path.display());
            let mut set = PrefixSet::new();
            set.insert_file(path)?;
            info!("loaded {} {kind} prefixes", set.len());
            Ok(Some(set))
        }
        None => Ok(None),
    }
}

/// Detached reporter printing all three statistics every five seconds. It
/// holds only `Arc`s and dies with the process.
fn spawn_reporter(
    prober: Arc<ProberStatistics>,
    sniffer: Arc<crate::stats::SnifferStatistics>,
    rate_limiter: Arc<crate::stats::RateLimiterStatistics>,
) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(5));
        info!("{}", rate_limiter.snapshot());
        info!("{}", prober.snapshot());
        info!("{}", sniffer.snapshot());
    });
}
