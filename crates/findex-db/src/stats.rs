//! Pool statistics: counters, gauges and acquisition latency percentiles.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Number of recent acquisition latencies kept for percentile computation.
pub const LATENCY_WINDOW: usize = 1024;

/// Immutable snapshot of pool statistics.
///
/// Every field is copied under the pool's bookkeeping lock in a single
/// critical section, so a snapshot always describes one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    /// Connections currently leased.
    pub active: usize,
    /// Connections parked and ready.
    pub idle: usize,
    /// All open connections, including those being opened or probed.
    pub total: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that gave up after `connection_timeout`.
    pub timeouts: u64,
    /// Health probes that failed.
    pub health_check_failures: u64,
    /// Highest number of simultaneously leased connections.
    pub peak_active: usize,
    /// Connections retired for age or health.
    pub recycled: u64,
    /// Busy retries performed by the write path.
    pub busy_retries: u64,
    /// Write attempts that surfaced as contention after all retries.
    pub write_contention_failures: u64,
    /// Acquisition latency over the recent window.
    pub latency: LatencySummary,
}

/// Percentiles over the recent acquisition latency window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Samples in the window.
    pub samples: usize,
    /// Median latency.
    pub p50_ms: f64,
    /// 95th percentile latency.
    pub p95_ms: f64,
    /// 99th percentile latency.
    pub p99_ms: f64,
    /// Largest latency in the window.
    pub max_ms: f64,
}

/// Counters owned by the pool and mutated only under its lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) created: u64,
    pub(crate) closed: u64,
    pub(crate) acquisitions: u64,
    pub(crate) timeouts: u64,
    pub(crate) health_check_failures: u64,
    pub(crate) peak_active: usize,
    pub(crate) recycled: u64,
    pub(crate) busy_retries: u64,
    pub(crate) write_contention_failures: u64,
}

/// Bounded FIFO of recent acquisition latencies.
#[derive(Debug)]
pub(crate) struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Copies the window so percentiles can be computed off-lock.
    pub(crate) fn samples(&self) -> Vec<Duration> {
        self.samples.iter().copied().collect()
    }
}

/// Summarises a set of latency samples.
pub(crate) fn summarize(mut samples: Vec<Duration>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    samples.sort_unstable();
    let ms = |d: Duration| d.as_secs_f64() * 1_000.0;
    LatencySummary {
        samples: samples.len(),
        p50_ms: ms(nearest_rank(&samples, 50.0)),
        p95_ms: ms(nearest_rank(&samples, 95.0)),
        p99_ms: ms(nearest_rank(&samples, 99.0)),
        max_ms: ms(samples[samples.len() - 1]),
    }
}

/// Nearest-rank percentile over an ascending, non-empty slice.
fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeroes() {
        let window = LatencyWindow::new(8);
        assert_eq!(summarize(window.samples()), LatencySummary::default());
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let mut window = LatencyWindow::new(LATENCY_WINDOW);
        for ms in 1..=100 {
            window.record(Duration::from_millis(ms));
        }
        let summary = summarize(window.samples());
        assert_eq!(summary.samples, 100);
        assert!((summary.p50_ms - 50.0).abs() < 1e-9);
        assert!((summary.p95_ms - 95.0).abs() < 1e-9);
        assert!((summary.p99_ms - 99.0).abs() < 1e-9);
        assert!((summary.max_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let mut window = LatencyWindow::new(3);
        for ms in [500, 1, 2, 3] {
            window.record(Duration::from_millis(ms));
        }
        let summary = summarize(window.samples());
        assert_eq!(summary.samples, 3);
        assert!((summary.max_ms - 3.0).abs() < 1e-9, "500ms sample should be evicted");
    }
}
