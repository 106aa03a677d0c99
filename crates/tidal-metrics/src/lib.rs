//! Engine clock and latency tracking with HdrHistogram.
//!
//! Provides nanosecond-precision timestamps for engine-stamped records and
//! latency distributions for the delivery path.

use std::time::{SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;

/// High-precision latency histogram.
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    /// Create a new histogram with 3 significant digits.
    pub fn new() -> Self {
        Self::with_precision(3)
    }

    /// Create with custom precision (clamped to 1-5 significant digits).
    pub fn with_precision(sigfig: u8) -> Self {
        Self {
            histogram: Histogram::new(sigfig.clamp(1, 5))
                .expect("1..=5 significant digits is always valid"),
        }
    }

    /// Record a latency value in nanoseconds. Negative samples are clamped to 0.
    #[inline(always)]
    pub fn record(&mut self, nanos: i64) {
        let _ = self.histogram.record(nanos.max(0) as u64);
    }

    /// Get value at percentile (0.0 - 100.0).
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        self.histogram.value_at_quantile(percentile / 100.0)
    }

    pub fn p50(&self) -> u64 {
        self.value_at_percentile(50.0)
    }

    pub fn p99(&self) -> u64 {
        self.value_at_percentile(99.0)
    }

    pub fn p999(&self) -> u64 {
        self.value_at_percentile(99.9)
    }

    pub fn max(&self) -> u64 {
        self.histogram.max()
    }

    pub fn min(&self) -> u64 {
        self.histogram.min()
    }

    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }

    /// Get total count of recorded values.
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
    }

    /// Log a summary of latencies under `label`.
    pub fn log_summary(&self, label: &str) {
        tracing::info!(
            label,
            count = self.count(),
            p50 = %Self::format_latency(self.p50()),
            p99 = %Self::format_latency(self.p99()),
            p999 = %Self::format_latency(self.p999()),
            max = %Self::format_latency(self.max()),
            "latency distribution"
        );
    }

    /// Format latency with appropriate units.
    pub fn format_latency(nanos: u64) -> String {
        if nanos < 1_000 {
            format!("{} ns", nanos)
        } else if nanos < 1_000_000 {
            format!("{:.2} μs", nanos as f64 / 1_000.0)
        } else if nanos < 1_000_000_000 {
            format!("{:.2} ms", nanos as f64 / 1_000_000.0)
        } else {
            format!("{:.2} s", nanos as f64 / 1_000_000_000.0)
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock nanoseconds derived from the TSC.
///
/// The system clock is read once at construction; afterwards time advances
/// with the monotonic `quanta` clock, so stamps never go backwards.
#[derive(Clone)]
pub struct EpochClock {
    clock: quanta::Clock,
    start: quanta::Instant,
    anchor_nanos: i64,
}

impl EpochClock {
    pub fn new() -> Self {
        let clock = quanta::Clock::new();
        let start = clock.now();
        let anchor_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            clock,
            start,
            anchor_nanos,
        }
    }

    /// Nanoseconds since the Unix epoch.
    #[inline(always)]
    pub fn now_nanos(&self) -> i64 {
        self.anchor_nanos + self.clock.now().duration_since(self.start).as_nanos() as i64
    }

    /// Whole seconds since the Unix epoch.
    #[inline(always)]
    pub fn now_secs(&self) -> i64 {
        self.now_nanos() / 1_000_000_000
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_basic() {
        let mut h = LatencyHistogram::new();

        for i in 1..=100 {
            h.record(i * 100);
        }

        assert_eq!(h.count(), 100);
        assert!(h.p50() >= 4900 && h.p50() <= 5100);
        assert_eq!(h.min(), 100);
        // HdrHistogram may round max value slightly
        assert!(h.max() >= 10000 && h.max() <= 10100);
    }

    #[test]
    fn test_negative_samples_clamped() {
        let mut h = LatencyHistogram::new();
        h.record(-50);
        assert_eq!(h.count(), 1);
        assert_eq!(h.max(), 0);
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(LatencyHistogram::format_latency(500), "500 ns");
        assert_eq!(LatencyHistogram::format_latency(5000), "5.00 μs");
        assert_eq!(LatencyHistogram::format_latency(5_000_000), "5.00 ms");
    }

    #[test]
    fn test_epoch_clock_monotonic() {
        let clock = EpochClock::new();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
        // After 2020-01-01.
        assert!(clock.now_secs() > 1_577_836_800);
    }
}
