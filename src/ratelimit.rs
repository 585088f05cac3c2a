//! Batched pacing of the probing loop.
//!
//! `wait()` is called after every batch of sends and targets an inter-batch
//! interval of `batch_size / target_rate` seconds, measured from the return
//! of the previous `wait()`. OS sleeps overshoot by the scheduler's
//! resolution, so the default method sleeps until one resolution margin
//! before the deadline and spins the rest.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::RateLimitingMethod;
use crate::stats::{RateLimiterStatistics, RateLimiterSnapshot};

pub struct RateLimiter {
    interval: Duration,
    method: RateLimitingMethod,
    sleep_precision: Duration,
    last: Instant,
    statistics: Arc<RateLimiterStatistics>,
}

impl RateLimiter {
    /// Create a limiter for `target_rate` packets per second, invoked every
    /// `batch_size` packets. A zero rate disables pacing.
    pub fn new(target_rate: u64, batch_size: u64, method: RateLimitingMethod) -> Self {
        let interval = if target_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(batch_size as f64 / target_rate as f64)
        };
        let sleep_precision = measure_sleep_precision();
        info!(
            "rate_limiter interval={:?} method={} sleep_precision={:?}",
            interval, method, sleep_precision
        );
        if !interval.is_zero()
            && interval < sleep_precision
            && method == RateLimitingMethod::Sleep
        {
            warn!(
                "sleep precision {:?} is coarser than the {:?} batch interval; \
                 the effective rate will fall short of {} pps",
                sleep_precision, interval, target_rate
            );
        }
        Self {
            interval,
            method,
            sleep_precision,
            last: Instant::now(),
            statistics: Arc::new(RateLimiterStatistics::new(batch_size)),
        }
    }

    /// Block until the inter-batch interval since the previous `wait()`
    /// return has elapsed.
    pub fn wait(&mut self) {
        if self.interval.is_zero() {
            self.last = Instant::now();
            return;
        }
        let start = Instant::now();
        let deadline = self.last + self.interval;
        if start < deadline {
            match self.method {
                RateLimitingMethod::Sleep => thread::sleep(deadline - start),
                RateLimitingMethod::Active => spin_until(deadline),
                RateLimitingMethod::Auto => {
                    let residual = deadline - start;
                    if residual > self.sleep_precision {
                        thread::sleep(residual - self.sleep_precision);
                    }
                    spin_until(deadline);
                }
            }
        }
        let now = Instant::now();
        self.statistics.record_wait(now - start);
        self.last = now;
    }

    pub fn statistics(&self) -> Arc<RateLimiterStatistics> {
        self.statistics.clone()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        self.statistics.snapshot()
    }
}

fn spin_until(deadline: Instant) {
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Worst observed overshoot of a minimal sleep. This is what an OS sleep
/// costs on this host, and the margin the Auto method spins across.
fn measure_sleep_precision() -> Duration {
    let mut worst = Duration::ZERO;
    for _ in 0..5 {
        let start = Instant::now();
        thread::sleep(Duration::from_micros(100));
        worst = worst.max(start.elapsed());
    }
    worst
}
