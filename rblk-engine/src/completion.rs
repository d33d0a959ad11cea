//! Drains transport completions back into the tracker.

use crate::engine::Shared;
use crate::{CompletionOutcome, Opcode};
use rblk_core::{RblkError, Result};
use rblk_io::Completion;
use rblk_metrics::EngineCounters;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Returns `true` if every in-flight operation completed before the
/// worker stopped.
pub(crate) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<bool>> {
    thread::Builder::new()
        .name("rblk-completion".into())
        .spawn(move || run(&shared))
        .map_err(RblkError::Io)
}

fn run(shared: &Shared) -> bool {
    debug!(target: "rblk::engine", "Completion worker started");
    let mut idle = shared.completion_policy.backoff(shared.pause.as_ref());
    let mut deadline: Option<Instant> = None;

    let drained = loop {
        if shared.failed.load(Ordering::Acquire) {
            fail_outstanding(shared);
            break false;
        }
        if shared.draining.load(Ordering::Acquire) {
            let deadline = *deadline.get_or_insert_with(|| Instant::now() + shared.grace_period);
            if shared.gate.in_flight() == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                warn!(
                    target: "rblk::engine",
                    in_flight = shared.gate.in_flight(),
                    "Grace period elapsed with operations in flight"
                );
                break false;
            }
        }

        match shared.transport.poll_completion() {
            Ok(Some(completion)) => {
                idle.reset();
                apply(shared, completion);
            },
            Ok(None) => {
                if idle.wait().is_err() {
                    let in_flight = shared.gate.in_flight();
                    if in_flight > 0 {
                        warn!(
                            target: "rblk::engine",
                            in_flight,
                            waits = idle.attempts(),
                            "No completions while operations are in flight"
                        );
                    }
                    idle.reset();
                }
            },
            Err(e) => {
                error!(target: "rblk::engine", error = %e, "Completion channel failed; engine stopping");
                shared.failed.store(true, Ordering::Release);
            },
        }
    };

    debug!(target: "rblk::engine", drained, "Completion worker stopped");
    drained
}

fn apply(shared: &Shared, completion: Completion) {
    let Completion { tag, status, payload } = completion;
    // Only the first completion for an issued tag returns its slot. A late
    // completion for an abandoned request still frees the slot it held.
    let released = shared.gate.release(tag);
    match shared.tracker.complete_sub_operation(tag, status, payload) {
        CompletionOutcome::Applied {
            opcode,
            position,
            length,
            succeeded,
            ..
        } => {
            if !released {
                warn!(
                    target: "rblk::engine",
                    request_id = tag.request_id,
                    sub_index = tag.sub_index,
                    "Completion for a sub-operation holding no in-flight slot"
                );
            }
            EngineCounters::incr(&shared.counters.sub_ops_completed);
            if succeeded {
                shared.counters.record_transfer(opcode == Opcode::Read, length);
                if let (Opcode::Read, Some(pages)) = (opcode, &shared.page_stats) {
                    pages.record_fetch(position, length);
                }
            }
        },
        CompletionOutcome::Stale | CompletionOutcome::Duplicate => {},
    }
    EngineCounters::set(&shared.counters.in_flight, shared.gate.in_flight() as u64);
}

/// Requests on a failed transport will never complete; finalize them now.
fn fail_outstanding(shared: &Shared) {
    let abandoned = shared.tracker.abandon_all();
    if abandoned > 0 {
        error!(target: "rblk::engine", abandoned, "Failed requests outstanding on a dead transport");
    }
}
