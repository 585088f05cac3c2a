//! Probing and capture counters shared across threads.
//!
//! Each counter struct is mutated only by its owning thread; the reporter
//! thread reads consistent-enough values through `snapshot()`. Relaxed
//! ordering is fine; the counters are monotonic and independent.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::records::Reply;

/// Counters owned by the probing loop.
#[derive(Debug, Default)]
pub struct ProberStatistics {
    read: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    filtered_lo_ttl: AtomicU64,
    filtered_hi_ttl: AtomicU64,
    filtered_prefix_excl: AtomicU64,
    filtered_prefix_not_incl: AtomicU64,
}

impl ProberStatistics {
    pub fn record_read(&self) {
        self.read.fetch_add(1, Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Relaxed);
    }

    pub fn record_filtered_lo_ttl(&self) {
        self.filtered_lo_ttl.fetch_add(1, Relaxed);
    }

    pub fn record_filtered_hi_ttl(&self) {
        self.filtered_hi_ttl.fetch_add(1, Relaxed);
    }

    pub fn record_filtered_prefix_excl(&self) {
        self.filtered_prefix_excl.fetch_add(1, Relaxed);
    }

    pub fn record_filtered_prefix_not_incl(&self) {
        self.filtered_prefix_not_incl.fetch_add(1, Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Relaxed)
    }

    pub fn snapshot(&self) -> ProberSnapshot {
        ProberSnapshot {
            read: self.read.load(Relaxed),
            sent: self.sent.load(Relaxed),
            failed: self.failed.load(Relaxed),
            filtered_lo_ttl: self.filtered_lo_ttl.load(Relaxed),
            filtered_hi_ttl: self.filtered_hi_ttl.load(Relaxed),
            filtered_prefix_excl: self.filtered_prefix_excl.load(Relaxed),
            filtered_prefix_not_incl: self.filtered_prefix_not_incl.load(Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProberStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProberSnapshot {
    pub read: u64,
    pub sent: u64,
    pub failed: u64,
    pub filtered_lo_ttl: u64,
    pub filtered_hi_ttl: u64,
    pub filtered_prefix_excl: u64,
    pub filtered_prefix_not_incl: u64,
}

impl ProberSnapshot {
    /// Every read probe is accounted for in exactly one bucket.
    pub fn filtered(&self) -> u64 {
        self.filtered_lo_ttl
            + self.filtered_hi_ttl
            + self.filtered_prefix_excl
            + self.filtered_prefix_not_incl
    }
}

impl fmt::Display for ProberSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probes_read={} packets_sent={} packets_failed={} \
             filtered_low_ttl={} filtered_high_ttl={} \
             filtered_prefix_excluded={} filtered_prefix_not_included={}",
            self.read,
            self.sent,
            self.failed,
            self.filtered_lo_ttl,
            self.filtered_hi_ttl,
            self.filtered_prefix_excl,
            self.filtered_prefix_not_incl,
        )
    }
}

/// Counters owned by the sniffer thread.
#[derive(Debug, Default)]
pub struct SnifferStatistics {
    received_count: AtomicU64,
    received_invalid_count: AtomicU64,
    /// Every address seen sourcing a matched reply.
    sources_all: Mutex<HashSet<IpAddr>>,
    /// Addresses whose replies came from the probed destination itself.
    sources_path: Mutex<HashSet<IpAddr>>,
}

impl SnifferStatistics {
    pub fn record_received(&self) {
        self.received_count.fetch_add(1, Relaxed);
    }

    pub fn record_invalid(&self) {
        self.received_invalid_count.fetch_add(1, Relaxed);
    }

    pub fn record_reply(&self, reply: &Reply) {
        self.sources_all.lock().insert(reply.reply_src_addr);
        if reply.is_from_destination() {
            self.sources_path.lock().insert(reply.reply_src_addr);
        }
    }

    pub fn received_count(&self) -> u64 {
        self.received_count.load(Relaxed)
    }

    pub fn snapshot(&self) -> SnifferSnapshot {
        SnifferSnapshot {
            received_count: self.received_count.load(Relaxed),
            received_invalid_count: self.received_invalid_count.load(Relaxed),
            distinct_sources: self.sources_all.lock().len() as u64,
            distinct_destination_sources: self.sources_path.lock().len() as u64,
        }
    }
}

/// Point-in-time copy of [`SnifferStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnifferSnapshot {
    pub received_count: u64,
    pub received_invalid_count: u64,
    pub distinct_sources: u64,
    pub distinct_destination_sources: u64,
}

impl fmt::Display for SnifferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames_received={} frames_invalid={} reply_sources={} destination_sources={}",
            self.received_count,
            self.received_invalid_count,
            self.distinct_sources,
            self.distinct_destination_sources,
        )
    }
}

/// Counters owned by the rate limiter, read by the reporter.
#[derive(Debug)]
pub struct RateLimiterStatistics {
    batch_size: u64,
    started: Instant,
    batches: AtomicU64,
    waited_us: AtomicU64,
}

impl RateLimiterStatistics {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size,
            started: Instant::now(),
            batches: AtomicU64::new(0),
            waited_us: AtomicU64::new(0),
        }
    }

    pub fn record_wait(&self, waited: Duration) {
        self.batches.fetch_add(1, Relaxed);
        self.waited_us
            .fetch_add(waited.as_micros() as u64, Relaxed);
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let packets = self.batches.load(Relaxed) * self.batch_size;
        RateLimiterSnapshot {
            average_rate: if elapsed > 0.0 {
                packets as f64 / elapsed
            } else {
                0.0
            },
            total_waited: Duration::from_micros(self.waited_us.load(Relaxed)),
        }
    }
}

/// Point-in-time copy of [`RateLimiterStatistics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterSnapshot {
    /// Packets per second averaged since the limiter was created.
    pub average_rate: f64,
    /// Cumulative time spent sleeping or spinning.
    pub total_waited: Duration,
}

impl fmt::Display for RateLimiterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "average_rate={:.0}pps total_waited={:?}",
            self.average_rate, self.total_waited
        )
    }
}
