//! Cycle metrics for the process data exchange.
//!
//! A fixed ring buffer keeps recent exchange latencies so the cyclic
//! thread never allocates while recording.

use serde::Serialize;
use std::time::Duration;

/// Latency and work counter statistics of the cyclic exchange.
#[derive(Debug)]
pub struct CycleMetrics {
    /// Ring buffer of exchange round-trip times in nanoseconds.
    samples: Box<[u64]>,
    write_pos: usize,
    sample_count: usize,
    total_cycles: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
    /// Exchanges whose round trip exceeded the send cycle.
    overrun_count: u64,
    /// Exchanges that came back with a short work counter.
    wkc_error_count: u64,
    /// Exchanges where no frame came back at all.
    lost_frame_count: u64,
    deadline_ns: u64,
}

impl CycleMetrics {
    /// Create a collector retaining `histogram_size` samples.
    ///
    /// Exchanges slower than `cycle_deadline` count as overruns.
    #[must_use]
    pub fn new(histogram_size: usize, cycle_deadline: Duration) -> Self {
        Self {
            samples: vec![0u64; histogram_size.max(1)].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_cycles: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            wkc_error_count: 0,
            lost_frame_count: 0,
            deadline_ns: duration_ns(cycle_deadline),
        }
    }

    /// Record one completed exchange.
    pub fn record(&mut self, round_trip: Duration, wkc: u16, expected_wkc: u16) {
        let ns = duration_ns(round_trip);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.total_cycles += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        if ns > self.deadline_ns {
            self.overrun_count += 1;
        }
        if wkc < expected_wkc {
            self.wkc_error_count += 1;
        }
    }

    /// Record an exchange where no frame returned.
    pub fn record_lost(&mut self) {
        self.total_cycles += 1;
        self.lost_frame_count += 1;
    }

    /// Total exchanges attempted.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Exchanges with a work counter below the expected value.
    #[must_use]
    pub fn wkc_error_count(&self) -> u64 {
        self.wkc_error_count
    }

    /// Compute a percentile (0.0 to 100.0) of the retained latencies.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.total_cycles - self.lost_frame_count;
        let has = completed > 0;
        MetricsSnapshot {
            total_cycles: self.total_cycles,
            min_ns: has.then_some(self.min_ns),
            max_ns: has.then_some(self.max_ns),
            mean_ns: has.then(|| self.sum_ns / completed),
            p99_ns: self.percentile(99.0).map(duration_ns),
            overrun_count: self.overrun_count,
            wkc_error_count: self.wkc_error_count,
            lost_frame_count: self.lost_frame_count,
        }
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        let deadline = Duration::from_nanos(self.deadline_ns);
        *self = Self::new(self.samples.len(), deadline);
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Immutable snapshot of metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Total exchanges attempted.
    pub total_cycles: u64,
    /// Fastest round trip in nanoseconds.
    pub min_ns: Option<u64>,
    /// Slowest round trip in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean round trip in nanoseconds.
    pub mean_ns: Option<u64>,
    /// 99th percentile of retained samples.
    pub p99_ns: Option<u64>,
    /// Round trips longer than the send cycle.
    pub overrun_count: u64,
    /// Exchanges with a short work counter.
    pub wkc_error_count: u64,
    /// Exchanges with no reply.
    pub lost_frame_count: u64,
}

impl MetricsSnapshot {
    /// Jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_recording() {
        let mut metrics = CycleMetrics::new(100, Duration::from_millis(1));

        metrics.record(Duration::from_micros(120), 3, 3);
        metrics.record(Duration::from_micros(180), 3, 3);
        metrics.record(Duration::from_micros(150), 2, 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_cycles, 3);
        assert_eq!(snap.min_ns, Some(120_000));
        assert_eq!(snap.max_ns, Some(180_000));
        assert_eq!(snap.mean_ns, Some(150_000));
        assert_eq!(snap.wkc_error_count, 1);
        assert_eq!(snap.jitter_ns(), Some(60_000));
    }

    #[test]
    fn test_overrun_and_lost() {
        let mut metrics = CycleMetrics::new(16, Duration::from_millis(1));

        metrics.record(Duration::from_micros(900), 6, 6);
        metrics.record(Duration::from_micros(1100), 6, 6);
        metrics.record_lost();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_cycles, 3);
        assert_eq!(snap.overrun_count, 1);
        assert_eq!(snap.lost_frame_count, 1);
        assert_eq!(snap.mean_ns, Some(1_000_000));
    }

    #[test]
    fn test_percentile_wraps_ring() {
        let mut metrics = CycleMetrics::new(10, Duration::from_millis(1));
        for i in 1..=25 {
            metrics.record(Duration::from_micros(i), 1, 1);
        }

        // Only the last ten samples (16..=25) are retained.
        assert_eq!(metrics.percentile(0.0), Some(Duration::from_micros(16)));
        assert_eq!(metrics.percentile(100.0), Some(Duration::from_micros(25)));
        assert!(metrics.percentile(f64::NAN).is_none());
        assert!(metrics.percentile(101.0).is_none());
    }

    #[test]
    fn test_reset() {
        let mut metrics = CycleMetrics::new(8, Duration::from_millis(1));
        metrics.record(Duration::from_millis(2), 0, 1);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_cycles, 0);
        assert_eq!(snap.overrun_count, 0);
        assert!(snap.min_ns.is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CycleMetrics::new(4, Duration::from_millis(1));
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"wkc_error_count\":0"));
    }
}
