use rblk_core::PAGE_SIZE;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Engine-wide counters. Purely observational; nothing in the engine reads
/// them back to make decisions.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub requests_submitted: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub sub_ops_issued: AtomicU64,
    pub sub_ops_completed: AtomicU64,
    pub sub_op_errors: AtomicU64,
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub duplicate_completions: AtomicU64,
    pub stale_completions: AtomicU64,
    pub busy_retries: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub abandoned: AtomicU64,
    pub in_flight: AtomicU64,
    pub pending_requests: AtomicU64,
}

impl EngineCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Count a finished transfer in pages, rounding partial pages up.
    #[inline]
    pub fn record_transfer(&self, is_read: bool, bytes: usize) {
        let pages = bytes.div_ceil(PAGE_SIZE) as u64;
        if is_read {
            Self::add(&self.pages_read, pages);
        } else {
            Self::add(&self.pages_written, pages);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_rejected: u64,
    pub sub_ops_issued: u64,
    pub sub_ops_completed: u64,
    pub sub_op_errors: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub duplicate_completions: u64,
    pub stale_completions: u64,
    pub busy_retries: u64,
    pub retries_exhausted: u64,
    pub abandoned: u64,
    pub in_flight: u64,
    pub pending_requests: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn capture(counters: &EngineCounters) -> Self {
        Self {
            requests_submitted: counters.requests_submitted.load(Ordering::Relaxed),
            requests_completed: counters.requests_completed.load(Ordering::Relaxed),
            requests_failed: counters.requests_failed.load(Ordering::Relaxed),
            requests_rejected: counters.requests_rejected.load(Ordering::Relaxed),
            sub_ops_issued: counters.sub_ops_issued.load(Ordering::Relaxed),
            sub_ops_completed: counters.sub_ops_completed.load(Ordering::Relaxed),
            sub_op_errors: counters.sub_op_errors.load(Ordering::Relaxed),
            pages_read: counters.pages_read.load(Ordering::Relaxed),
            pages_written: counters.pages_written.load(Ordering::Relaxed),
            duplicate_completions: counters.duplicate_completions.load(Ordering::Relaxed),
            stale_completions: counters.stale_completions.load(Ordering::Relaxed),
            busy_retries: counters.busy_retries.load(Ordering::Relaxed),
            retries_exhausted: counters.retries_exhausted.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            in_flight: counters.in_flight.load(Ordering::Relaxed),
            pending_requests: counters.pending_requests.load(Ordering::Relaxed),
        }
    }

    /// Counter growth since `earlier`; gauges keep their current value.
    #[must_use]
    pub fn delta(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            requests_submitted: self.requests_submitted.saturating_sub(earlier.requests_submitted),
            requests_completed: self.requests_completed.saturating_sub(earlier.requests_completed),
            requests_failed: self.requests_failed.saturating_sub(earlier.requests_failed),
            requests_rejected: self.requests_rejected.saturating_sub(earlier.requests_rejected),
            sub_ops_issued: self.sub_ops_issued.saturating_sub(earlier.sub_ops_issued),
            sub_ops_completed: self.sub_ops_completed.saturating_sub(earlier.sub_ops_completed),
            sub_op_errors: self.sub_op_errors.saturating_sub(earlier.sub_op_errors),
            pages_read: self.pages_read.saturating_sub(earlier.pages_read),
            pages_written: self.pages_written.saturating_sub(earlier.pages_written),
            duplicate_completions: self
                .duplicate_completions
                .saturating_sub(earlier.duplicate_completions),
            stale_completions: self.stale_completions.saturating_sub(earlier.stale_completions),
            busy_retries: self.busy_retries.saturating_sub(earlier.busy_retries),
            retries_exhausted: self.retries_exhausted.saturating_sub(earlier.retries_exhausted),
            abandoned: self.abandoned.saturating_sub(earlier.abandoned),
            in_flight: self.in_flight,
            pending_requests: self.pending_requests,
        }
    }

    #[inline]
    #[must_use]
    pub fn served_pages(&self) -> u64 {
        self.pages_read + self.pages_written
    }

    /// Page throughput over `interval` in megabits per second.
    #[must_use]
    pub fn throughput_mbps(&self, interval: Duration) -> f64 {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let bits = self.served_pages() as f64 * PAGE_SIZE as f64 * 8.0;
        bits / 1024.0 / 1024.0 / secs
    }
}

pub fn describe_metrics() {
    metrics::describe_counter!("rblk_requests_submitted_total", "Requests accepted by the engine");
    metrics::describe_counter!(
        "rblk_requests_completed_total",
        "Requests finalized, successfully or not"
    );
    metrics::describe_counter!("rblk_requests_failed_total", "Requests finalized with an I/O error");
    metrics::describe_counter!(
        "rblk_requests_rejected_total",
        "Requests refused at submit (busy, segment limit, bounds)"
    );
    metrics::describe_counter!("rblk_sub_ops_issued_total", "Sub-operations issued to the transport");
    metrics::describe_counter!("rblk_sub_ops_completed_total", "Sub-operation completions applied");
    metrics::describe_counter!("rblk_pages_read_total", "Pages fetched from remote memory");
    metrics::describe_counter!("rblk_pages_written_total", "Pages evicted to remote memory");
    metrics::describe_counter!(
        "rblk_protocol_warnings_total",
        "Duplicate and stale completions ignored"
    );
    metrics::describe_counter!("rblk_busy_retries_total", "Backoffs on a busy transport or full in-flight window");
    metrics::describe_gauge!("rblk_in_flight", "Sub-operations currently in flight");
    metrics::describe_gauge!("rblk_pending_requests", "Requests awaiting finalization");
}

pub fn export_snapshot(snapshot: &StatsSnapshot) {
    metrics::counter!("rblk_requests_submitted_total").absolute(snapshot.requests_submitted);
    metrics::counter!("rblk_requests_completed_total").absolute(snapshot.requests_completed);
    metrics::counter!("rblk_requests_failed_total").absolute(snapshot.requests_failed);
    metrics::counter!("rblk_requests_rejected_total").absolute(snapshot.requests_rejected);
    metrics::counter!("rblk_sub_ops_issued_total").absolute(snapshot.sub_ops_issued);
    metrics::counter!("rblk_sub_ops_completed_total").absolute(snapshot.sub_ops_completed);
    metrics::counter!("rblk_pages_read_total").absolute(snapshot.pages_read);
    metrics::counter!("rblk_pages_written_total").absolute(snapshot.pages_written);
    metrics::counter!("rblk_protocol_warnings_total")
        .absolute(snapshot.duplicate_completions + snapshot.stale_completions);
    metrics::counter!("rblk_busy_retries_total").absolute(snapshot.busy_retries);
    metrics::gauge!("rblk_in_flight").set(snapshot.in_flight as f64);
    metrics::gauge!("rblk_pending_requests").set(snapshot.pending_requests as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_delta() {
        let counters = EngineCounters::new();
        EngineCounters::add(&counters.sub_ops_completed, 10);
        counters.record_transfer(true, 3 * PAGE_SIZE);
        EngineCounters::set(&counters.in_flight, 4);
        let first = StatsSnapshot::capture(&counters);

        EngineCounters::add(&counters.sub_ops_completed, 5);
        counters.record_transfer(false, 10);
        EngineCounters::set(&counters.in_flight, 2);
        let second = StatsSnapshot::capture(&counters);

        let delta = second.delta(&first);
        assert_eq!(delta.sub_ops_completed, 5);
        assert_eq!(delta.pages_read, 0);
        assert_eq!(delta.pages_written, 1);
        assert_eq!(delta.in_flight, 2);
        assert_eq!(second.served_pages(), 4);
    }

    #[test]
    fn test_throughput_mbps() {
        let snapshot = StatsSnapshot {
            pages_read: 256,
            ..StatsSnapshot::default()
        };
        // 256 pages of 4 KiB = 1 MiB = 8 Mbit
        let mbps = snapshot.throughput_mbps(Duration::from_secs(1));
        assert!((mbps - 8.0).abs() < f64::EPSILON);
        assert!((snapshot.throughput_mbps(Duration::from_secs(2)) - 4.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.throughput_mbps(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_export_without_recorder_is_noop() {
        describe_metrics();
        export_snapshot(&StatsSnapshot::default());
    }
}
