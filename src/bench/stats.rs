use std::time::Duration;

use serde::Serialize;

use super::error::BenchError;

/// Statistics of one worker, owned by it until it is joined.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Index of the connection the worker drove.
    pub index: usize,
    /// Completed write+read round trips.
    pub ops: u64,
    /// Sum of round-trip latencies.
    pub latency: Duration,
    /// Sum of absolute differences between consecutive latencies.
    pub jitter: Duration,
    /// Latency of the last round trip.
    pub last_latency: Option<Duration>,
    /// Message bytes of completed round trips, one message each.
    pub bytes: u64,
    /// Wall time from the start gate to the end of the loop.
    pub elapsed: Duration,
    /// The error that ended the loop early, if any.
    pub error: Option<BenchError>,
}

impl WorkerStats {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Account for one completed round trip.
    pub fn record(&mut self, latency: Duration, bytes: u64) {
        self.ops += 1;
        self.latency += latency;
        if let Some(last) = self.last_latency {
            self.jitter += last.abs_diff(latency);
        }
        self.last_latency = Some(latency);
        self.bytes += bytes;
    }

    /// Number of jitter samples, one fewer than the operations.
    #[inline]
    pub fn jitter_samples(&self) -> u64 {
        self.ops.saturating_sub(1)
    }

    pub fn mean_latency(&self) -> Duration {
        mean(self.latency, self.ops)
    }

    pub fn mean_jitter(&self) -> Duration {
        mean(self.jitter, self.jitter_samples())
    }

    #[inline]
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

fn mean(total: Duration, n: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((total.as_nanos() / n as u128) as u64)
}

fn per_sec(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}

const GIB: f64 = (1u64 << 30) as f64;

/// One row of a report, describing a single worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRow {
    pub index: usize,
    pub ops: u64,
    pub elapsed_ns: u64,
    pub mean_latency_ns: u64,
    pub mean_jitter_ns: u64,
    pub bytes: u64,
    pub throughput_gibps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&WorkerStats> for WorkerRow {
    fn from(stats: &WorkerStats) -> Self {
        Self {
            index: stats.index,
            ops: stats.ops,
            elapsed_ns: stats.elapsed.as_nanos() as u64,
            mean_latency_ns: stats.mean_latency().as_nanos() as u64,
            mean_jitter_ns: stats.mean_jitter().as_nanos() as u64,
            bytes: stats.bytes,
            throughput_gibps: per_sec(stats.bytes as f64, stats.elapsed) / GIB,
            error: stats.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Aggregated result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub message_size: usize,
    pub workers: usize,
    pub failed_workers: usize,
    pub ops: u64,
    pub bytes: u64,
    pub elapsed_ns: u64,
    pub mean_latency_ns: u64,
    pub mean_jitter_ns: u64,
    pub throughput_bps: f64,
    pub throughput_gibps: f64,
    pub rows: Vec<WorkerRow>,
}

/// Combine the statistics of all joined workers.
///
/// Elapsed time is averaged across workers; throughput is the total message
/// bytes over that average.
pub fn aggregate(stats: &[WorkerStats], message_size: usize) -> BenchReport {
    let ops: u64 = stats.iter().map(|s| s.ops).sum();
    let bytes: u64 = stats.iter().map(|s| s.bytes).sum();
    let latency: Duration = stats.iter().map(|s| s.latency).sum();
    let jitter: Duration = stats.iter().map(|s| s.jitter).sum();
    let samples: u64 = stats.iter().map(WorkerStats::jitter_samples).sum();
    let elapsed = stats
        .iter()
        .map(|s| s.elapsed)
        .sum::<Duration>()
        .checked_div(stats.len() as u32)
        .unwrap_or_default();

    let throughput_bps = per_sec(bytes as f64, elapsed);
    BenchReport {
        message_size,
        workers: stats.len(),
        failed_workers: stats.iter().filter(|s| s.failed()).count(),
        ops,
        bytes,
        elapsed_ns: elapsed.as_nanos() as u64,
        mean_latency_ns: mean(latency, ops).as_nanos() as u64,
        mean_jitter_ns: mean(jitter, samples).as_nanos() as u64,
        throughput_bps,
        throughput_gibps: throughput_bps / GIB,
        rows: stats.iter().map(WorkerRow::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cq::WcStatus;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn latency_and_jitter() {
        let mut s = WorkerStats::new(0);
        s.record(ms(10), 200);
        assert_eq!(s.jitter, Duration::ZERO);
        s.record(ms(14), 200);
        s.record(ms(11), 200);
        assert_eq!(s.ops, 3);
        assert_eq!(s.latency, ms(35));
        assert_eq!(s.jitter, ms(7));
        assert_eq!(s.mean_jitter(), Duration::from_micros(3500));
        assert_eq!(s.bytes, 600);
    }

    #[test]
    fn aggregate_sums_and_averages() {
        let mut a = WorkerStats::new(0);
        a.record(ms(2), 100);
        a.record(ms(4), 100);
        a.elapsed = ms(1000);
        let mut b = WorkerStats::new(1);
        b.record(ms(3), 100);
        b.elapsed = ms(3000);
        b.error = Some(BenchError::Completion {
            wr_id: 1,
            status: WcStatus::RemAccessErr,
        });

        let report = aggregate(&[a, b], 50);
        assert_eq!(report.ops, 3);
        assert_eq!(report.bytes, 300);
        assert_eq!(report.mean_latency_ns, 3_000_000);
        // One jitter sample from `a`, none from `b`.
        assert_eq!(report.mean_jitter_ns, 2_000_000);
        assert_eq!(report.elapsed_ns, 2_000_000_000);
        assert_eq!(report.throughput_bps, 150.0);
        assert_eq!(report.failed_workers, 1);
        assert!(report.rows[1].error.is_some());
    }

    #[test]
    fn zero_guards() {
        let report = aggregate(&[], 100);
        assert_eq!(report.ops, 0);
        assert_eq!(report.mean_latency_ns, 0);
        assert_eq!(report.throughput_bps, 0.0);

        let idle = WorkerStats::new(3);
        let report = aggregate(&[idle], 100);
        assert_eq!(report.mean_jitter_ns, 0);
        assert_eq!(report.rows[0].throughput_gibps, 0.0);
    }
}
