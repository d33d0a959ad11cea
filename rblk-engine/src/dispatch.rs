//! Issues queued sub-operations to the transport under the in-flight cap.

use crate::engine::Shared;
use crate::{DispatchItem, Opcode, SubOpStatus};
use rblk_core::{Backoff, RblkError, Result, RetryPolicy};
use rblk_metrics::EngineCounters;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Returns the number of sub-operations failed because dispatch stopped
/// before issuing them.
pub(crate) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<usize>> {
    thread::Builder::new()
        .name("rblk-dispatch".into())
        .spawn(move || run(&shared))
        .map_err(RblkError::Io)
}

fn run(shared: &Shared) -> usize {
    debug!(target: "rblk::engine", queue_depth = shared.gate.limit(), "Dispatch worker started");
    let idle_policy = RetryPolicy::unbounded(shared.dispatch_policy.backoff)
        .with_spin(shared.dispatch_policy.spin_attempts);
    let mut idle = idle_policy.backoff(shared.pause.as_ref());

    while !shared.stop_dispatch.load(Ordering::Acquire) {
        match shared.tracker.next_dispatch() {
            Some(item) => {
                idle.reset();
                dispatch_one(shared, &item);
            },
            None => {
                if idle.wait().is_err() {
                    idle.reset();
                }
            },
        }
    }

    let not_issued = shared.tracker.fail_undispatched();
    if not_issued > 0 {
        warn!(target: "rblk::engine", not_issued, "Dispatch stopped with sub-operations not issued");
    }
    debug!(target: "rblk::engine", "Dispatch worker stopped");
    not_issued
}

fn dispatch_one(shared: &Shared, item: &DispatchItem) {
    let mut backoff = shared.dispatch_policy.backoff(shared.pause.as_ref());
    loop {
        if shared.failed.load(Ordering::Acquire) || shared.stop_dispatch.load(Ordering::Acquire) {
            shared.tracker.fail_sub_operation(item.tag);
            return;
        }
        if !shared.gate.try_acquire(item.tag) {
            let saturated = RblkError::InFlightSaturated {
                limit: shared.gate.limit(),
            };
            if !wait_busy(shared, &mut backoff, item, &saturated) {
                return;
            }
            continue;
        }
        EngineCounters::set(&shared.counters.in_flight, shared.gate.in_flight() as u64);
        shared.tracker.advance(item.tag, SubOpStatus::Started);

        let issued = match item.opcode {
            Opcode::Read => shared
                .transport
                .issue_read(item.tag, item.position, item.length),
            Opcode::Write => shared
                .transport
                .issue_write(item.tag, item.position, &item.payload),
        };
        match issued {
            Ok(()) => {
                shared.tracker.advance(item.tag, SubOpStatus::Pushed);
                EngineCounters::incr(&shared.counters.sub_ops_issued);
                trace!(
                    target: "rblk::engine",
                    request_id = item.tag.request_id,
                    sub_index = item.tag.sub_index,
                    opcode = ?item.opcode,
                    position = item.position,
                    "Sub-operation issued"
                );
                return;
            },
            Err(e) => {
                shared.gate.release(item.tag);
                if e.is_retryable() {
                    if !wait_busy(shared, &mut backoff, item, &e) {
                        return;
                    }
                    continue;
                }
                if e.is_fatal() {
                    error!(
                        target: "rblk::engine",
                        request_id = item.tag.request_id,
                        error = %e,
                        "Transport failed while issuing; engine stopping"
                    );
                    shared.failed.store(true, Ordering::Release);
                } else {
                    warn!(
                        target: "rblk::engine",
                        request_id = item.tag.request_id,
                        sub_index = item.tag.sub_index,
                        error = %e,
                        "Sub-operation rejected by transport"
                    );
                }
                shared.tracker.fail_sub_operation(item.tag);
                return;
            },
        }
    }
}

/// Back off once. On an exhausted budget the sub-operation is failed and
/// `false` returned.
fn wait_busy(shared: &Shared, backoff: &mut Backoff<'_>, item: &DispatchItem, cause: &RblkError) -> bool {
    EngineCounters::incr(&shared.counters.busy_retries);
    if backoff.wait().is_ok() {
        return true;
    }
    EngineCounters::incr(&shared.counters.retries_exhausted);
    warn!(
        target: "rblk::engine",
        request_id = item.tag.request_id,
        sub_index = item.tag.sub_index,
        attempts = backoff.attempts(),
        cause = %cause,
        "Retry budget exhausted; failing sub-operation"
    );
    shared.tracker.fail_sub_operation(item.tag);
    false
}
