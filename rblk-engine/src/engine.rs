use crate::{
    CompletionSink, EngineConfig, InFlightGate, IoRequest, Rejected, Tracker, TrackerLimits,
    completion, dispatch,
};
use rblk_core::{Pause, RblkError, Result, RetryPolicy, ThreadSleep};
use rblk_io::Transport;
use rblk_metrics::{EngineCounters, PageStats, StatsReporter, StatsSnapshot, describe_metrics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// State shared by the engine handle and its worker threads.
pub(crate) struct Shared {
    pub(crate) tracker: Tracker,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) gate: InFlightGate,
    pub(crate) counters: Arc<EngineCounters>,
    pub(crate) page_stats: Option<Arc<PageStats>>,
    pub(crate) pause: Arc<dyn Pause>,
    pub(crate) dispatch_policy: RetryPolicy,
    pub(crate) completion_policy: RetryPolicy,
    pub(crate) grace_period: Duration,
    pub(crate) stop_dispatch: AtomicBool,
    pub(crate) draining: AtomicBool,
    /// Set once the transport fails; no further work is issued.
    pub(crate) failed: AtomicBool,
}

/// What [`Engine::shutdown`] had to give up on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sub-operations still queued when dispatch stopped.
    pub not_issued: usize,
    /// Whether every in-flight operation completed within the grace period.
    pub drained: bool,
    /// Requests finalized with an I/O error because they never completed.
    pub abandoned: usize,
}

/// The remote I/O engine: one explicitly constructed context owning the
/// tracker, the workers and the transport.
///
/// Shutdown order: stop accepting, stop dispatch, drain completions for the
/// grace period, abandon what is left, then close the transport.
pub struct Engine {
    shared: Arc<Shared>,
    dispatch: Mutex<Option<JoinHandle<usize>>>,
    completion: Mutex<Option<JoinHandle<bool>>>,
    stats: Mutex<Option<StatsReporter>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// # Errors
    /// Returns `Config` for an invalid configuration and `Io` if a worker
    /// thread cannot be spawned.
    pub fn start(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self> {
        Self::start_with_pause(config, transport, sink, Arc::new(ThreadSleep))
    }

    /// Start with an injected [`Pause`] for every backoff in the workers.
    ///
    /// # Errors
    /// Same as [`Engine::start`].
    pub fn start_with_pause(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn CompletionSink>,
        pause: Arc<dyn Pause>,
    ) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(EngineCounters::new());
        let page_stats = (config.stats.enabled && config.stats.page_stats)
            .then(|| Arc::new(PageStats::new()));
        let limits = TrackerLimits {
            max_segments: config.tracker.max_segments,
            max_segment_size: config.tracker.max_segment_size,
            dispatch_queue_capacity: config.tracker.dispatch_queue_capacity,
            capacity: transport.capacity(),
        };
        let queue_depth = transport.queue_depth();

        info!(
            target: "rblk::engine",
            transport = %transport.kind(),
            queue_depth,
            capacity = limits.capacity,
            max_segments = limits.max_segments,
            "Engine starting"
        );

        let shared = Arc::new(Shared {
            tracker: Tracker::new(limits, sink, Arc::clone(&counters)),
            transport,
            gate: InFlightGate::new(queue_depth),
            counters: Arc::clone(&counters),
            page_stats: page_stats.clone(),
            pause,
            dispatch_policy: config.dispatch.policy(),
            completion_policy: config.completion.policy(),
            grace_period: config.grace_period(),
            stop_dispatch: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let engine = Self {
            dispatch: Mutex::new(None),
            completion: Mutex::new(Some(completion::spawn(Arc::clone(&shared))?)),
            stats: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            shared,
        };
        // From here on a failed start is cleaned up by Drop.
        *lock(&engine.dispatch) = Some(dispatch::spawn(Arc::clone(&engine.shared))?);
        if config.stats.enabled {
            describe_metrics();
            *lock(&engine.stats) = Some(StatsReporter::spawn(
                counters,
                page_stats,
                config.stats_interval(),
            )?);
        }
        Ok(engine)
    }

    /// Hand a request to the engine. Its segments are dispatched in the
    /// background and the request comes back through the sink.
    ///
    /// # Errors
    /// Returns the request unchanged when it is refused; see
    /// [`Tracker::submit`]. After a transport failure every request is
    /// refused with `Disconnected`.
    pub fn submit(&self, request: IoRequest) -> std::result::Result<(), Rejected> {
        if self.shared.failed.load(Ordering::Acquire) {
            EngineCounters::incr(&self.shared.counters.requests_rejected);
            return Err(Rejected {
                request,
                error: RblkError::Disconnected,
            });
        }
        self.shared.tracker.submit(request)
    }

    /// `false` once the transport has failed or shutdown has begun.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.shared.failed.load(Ordering::Acquire) && !self.shut_down.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.gate.limit()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.gate.in_flight()
    }

    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.shared.gate.peak()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.tracker.pending_requests()
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<EngineCounters> {
        &self.shared.counters
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::capture(&self.shared.counters)
    }

    #[must_use]
    pub fn page_stats(&self) -> Option<&Arc<PageStats>> {
        self.shared.page_stats.as_ref()
    }

    /// Stop the engine. Idempotent; later calls return an empty report.
    ///
    /// # Errors
    /// Returns the transport's error if it cannot be closed cleanly. The
    /// workers are stopped and every request finalized regardless.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }
        info!(
            target: "rblk::engine",
            pending = self.pending_requests(),
            in_flight = self.in_flight(),
            "Engine shutting down"
        );

        self.shared.tracker.close();
        self.shared.stop_dispatch.store(true, Ordering::Release);
        let not_issued = join(&self.dispatch, "dispatch").unwrap_or(0);

        self.shared.draining.store(true, Ordering::Release);
        let drained = join(&self.completion, "completion").unwrap_or(false);

        let abandoned = self.shared.tracker.abandon_all();
        if abandoned > 0 {
            error!(target: "rblk::engine", abandoned, "Requests abandoned at shutdown");
        }

        let closed = self.shared.transport.shutdown();
        if let Err(e) = &closed {
            warn!(target: "rblk::engine", error = %e, "Transport did not close cleanly");
        }
        if let Some(mut stats) = lock(&self.stats).take() {
            stats.stop();
        }

        let report = ShutdownReport {
            not_issued,
            drained,
            abandoned,
        };
        info!(
            target: "rblk::engine",
            not_issued,
            drained,
            abandoned,
            "Engine stopped"
        );
        closed.map(|()| report)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "rblk::engine", error = %e, "Shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.shared.transport.kind())
            .field("queue_depth", &self.queue_depth())
            .field("in_flight", &self.in_flight())
            .field("pending_requests", &self.pending_requests())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join<T>(slot: &Mutex<Option<JoinHandle<T>>>, worker: &'static str) -> Option<T> {
    let handle = lock(slot).take()?;
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(target: "rblk::engine", worker, "Worker thread panicked");
            None
        },
    }
}
