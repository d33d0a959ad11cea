use crate::{EngineCounters, PageStats, StatsSnapshot, export_snapshot};
use rblk_core::{RblkError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const STOP_CHECK: Duration = Duration::from_millis(20);

/// Low-priority thread that logs throughput every interval and mirrors the
/// counters into the `metrics` facade.
pub struct StatsReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    /// # Errors
    /// Returns an error if the reporter thread cannot be spawned.
    pub fn spawn(
        counters: Arc<EngineCounters>,
        pages: Option<Arc<PageStats>>,
        interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rblk-stats".into())
            .spawn(move || run(&counters, pages.as_deref(), interval, &thread_stop))
            .map_err(RblkError::Io)?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop and join the reporter thread. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(counters: &EngineCounters, pages: Option<&PageStats>, interval: Duration, stop: &AtomicBool) {
    let mut previous = StatsSnapshot::capture(counters);
    let mut last = Instant::now();
    debug!(target: "rblk::stats", interval_ms = interval.as_millis() as u64, "Stats reporter started");

    while !stop.load(Ordering::Acquire) {
        thread::sleep(STOP_CHECK.min(interval));
        let elapsed = last.elapsed();
        if elapsed < interval {
            continue;
        }
        let current = StatsSnapshot::capture(counters);
        report(&current.delta(&previous), elapsed, pages);
        export_snapshot(&current);
        previous = current;
        last = Instant::now();
    }

    let total = StatsSnapshot::capture(counters);
    export_snapshot(&total);
    info!(
        target: "rblk::stats",
        requests_completed = total.requests_completed,
        requests_failed = total.requests_failed,
        served_pages = total.served_pages(),
        abandoned = total.abandoned,
        "Stats reporter stopped"
    );
}

fn report(delta: &StatsSnapshot, elapsed: Duration, pages: Option<&PageStats>) {
    if delta.served_pages() == 0 && delta.pending_requests == 0 {
        return;
    }
    let mbps = delta.throughput_mbps(elapsed);
    let summary = pages.map(PageStats::summary).unwrap_or_default();
    info!(
        target: "rblk::stats",
        served_pages = delta.served_pages(),
        read_pages = delta.pages_read,
        written_pages = delta.pages_written,
        mbps = format_args!("{mbps:.2}"),
        unique_pages = summary.unique_pages,
        average_refetch = format_args!("{:.2}", summary.average_refetch),
        pending = delta.pending_requests,
        in_flight = delta.in_flight,
        busy_retries = delta.busy_retries,
        "Throughput"
    );
}
