//! Request decomposition and completion tracking.
//!
//! Each accepted request becomes a [`PendingRequest`] in a lock-striped
//! index keyed by request id, and one [`DispatchItem`] per segment on a
//! bounded dispatch queue. The entry is inserted before any item becomes
//! visible to the dispatcher, so a completion can never arrive ahead of
//! registration. The sub-operation that brings the pending count to zero
//! removes the entry under the shard lock and finalizes it after the lock
//! is dropped; nothing can reach the request once it has been removed.

use crate::{CompletedRequest, CompletionSink, IoRequest, Opcode, Rejected, RequestStatus, Segment};
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use rblk_core::RblkError;
use rblk_io::{OpStatus, OpTag};
use rblk_metrics::EngineCounters;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

const INDEX_SHARDS: usize = 16;

/// Lifecycle of one sub-operation. Moves forward only; `Acked` and `Error`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOpStatus {
    Idle,
    /// Taken by the dispatcher and holding an in-flight slot.
    Started,
    /// Accepted by the transport.
    Pushed,
    Acked,
    Error,
}

impl SubOpStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SubOpStatus::Acked | SubOpStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            SubOpStatus::Idle => 0,
            SubOpStatus::Started => 1,
            SubOpStatus::Pushed => 2,
            SubOpStatus::Acked | SubOpStatus::Error => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerLimits {
    pub max_segments: usize,
    pub max_segment_size: usize,
    pub dispatch_queue_capacity: usize,
    /// Size of the remote memory behind the transport.
    pub capacity: u64,
}

/// One sub-operation waiting to be issued.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub tag: OpTag,
    pub opcode: Opcode,
    pub position: u64,
    pub length: usize,
    /// Data to evict; empty for reads.
    pub payload: Bytes,
}

/// What a completion did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied {
        opcode: Opcode,
        position: u64,
        length: usize,
        succeeded: bool,
        finalized: bool,
    },
    /// The sub-operation had already completed; nothing changed.
    Duplicate,
    /// No matching request or generation; nothing changed.
    Stale,
}

struct SubOperation {
    segment: Segment,
    status: SubOpStatus,
}

struct PendingRequest {
    generation: u64,
    sub_operations: Vec<SubOperation>,
    pending_count: AtomicU32,
    failed: bool,
}

pub struct Tracker {
    shards: Vec<Mutex<HashMap<u64, PendingRequest>>>,
    dispatch: ArrayQueue<DispatchItem>,
    // Serializes the space check and the pushes of one request.
    submit_lock: Mutex<()>,
    next_generation: AtomicU64,
    pending: AtomicUsize,
    accepting: AtomicBool,
    limits: TrackerLimits,
    sink: Arc<dyn CompletionSink>,
    counters: Arc<EngineCounters>,
}

impl Tracker {
    #[must_use]
    pub fn new(
        limits: TrackerLimits,
        sink: Arc<dyn CompletionSink>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            shards: (0..INDEX_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            dispatch: ArrayQueue::new(limits.dispatch_queue_capacity.max(1)),
            submit_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            limits,
            sink,
            counters,
        }
    }

    #[must_use]
    pub fn limits(&self) -> TrackerLimits {
        self.limits
    }

    /// Requests registered and not yet finalized.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Sub-operations waiting for the dispatcher.
    #[must_use]
    pub fn dispatch_backlog(&self) -> usize {
        self.dispatch.len()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse all further submissions.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Register a request and queue its sub-operations.
    ///
    /// A request with no segments is finalized `Ok` on the spot.
    ///
    /// # Errors
    /// Returns the request with `QueueFull` when the dispatch queue cannot
    /// take all of its segments (busy, retry later), `SegmentLimit` or
    /// `OutOfBounds` for requests that can never be served,
    /// `DuplicateRequest` when the id is still pending and `ShuttingDown`
    /// after [`Tracker::close`]. Nothing is queued on rejection.
    pub fn submit(&self, request: IoRequest) -> Result<(), Rejected> {
        if !self.is_accepting() {
            return Err(self.reject(request, RblkError::ShuttingDown));
        }
        if let Err(error) = self.check(&request) {
            return Err(self.reject(request, error));
        }
        if request.is_empty() {
            let request_id = request.request_id;
            if self.shard(request_id).contains_key(&request_id) {
                return Err(self.reject(request, RblkError::DuplicateRequest(request_id)));
            }
            EngineCounters::incr(&self.counters.requests_submitted);
            debug!(target: "rblk::engine", request_id = request.request_id, "Empty request finalized");
            self.finish(request.request_id, RequestStatus::Ok, Vec::new());
            return Ok(());
        }

        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let count = request.len();
        if self.dispatch.capacity() - self.dispatch.len() < count {
            return Err(self.reject(request, RblkError::QueueFull("dispatch queue")));
        }

        let request_id = request.request_id;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let items: Vec<DispatchItem> = request
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| DispatchItem {
                tag: OpTag {
                    request_id,
                    generation,
                    sub_index: index as u32,
                },
                opcode: segment.opcode,
                position: segment.position,
                length: segment.length,
                payload: segment.data.clone(),
            })
            .collect();

        {
            let mut shard = self.shard(request_id);
            if shard.contains_key(&request_id) {
                drop(shard);
                return Err(self.reject(request, RblkError::DuplicateRequest(request_id)));
            }
            shard.insert(
                request_id,
                PendingRequest {
                    generation,
                    sub_operations: request
                        .segments
                        .into_iter()
                        .map(|segment| SubOperation {
                            segment,
                            status: SubOpStatus::Idle,
                        })
                        .collect(),
                    pending_count: AtomicU32::new(count as u32),
                    failed: false,
                },
            );
        }
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        EngineCounters::set(&self.counters.pending_requests, pending as u64);
        EngineCounters::incr(&self.counters.requests_submitted);

        for item in items {
            if let Err(item) = self.dispatch.push(item) {
                // Space was reserved under the submit lock.
                error!(target: "rblk::engine", request_id, sub_index = item.tag.sub_index, "Dispatch queue overflow");
                self.fail_sub_operation(item.tag);
            }
        }
        trace!(target: "rblk::engine", request_id, generation, segments = count, "Request registered");
        Ok(())
    }

    fn check(&self, request: &IoRequest) -> Result<(), RblkError> {
        if request.len() > self.limits.max_segments {
            return Err(RblkError::SegmentLimit {
                segments: request.len(),
                max: self.limits.max_segments,
            });
        }
        for segment in &request.segments {
            let length = segment.length as u64;
            if segment.length == 0 || segment.length > self.limits.max_segment_size {
                return Err(RblkError::OutOfBounds {
                    position: segment.position,
                    length,
                    size: self.limits.max_segment_size as u64,
                });
            }
            if segment.opcode == Opcode::Write && segment.data.len() != segment.length {
                return Err(RblkError::OutOfBounds {
                    position: segment.position,
                    length: segment.data.len() as u64,
                    size: length,
                });
            }
            let end = segment.position.checked_add(length);
            if end.is_none_or(|end| end > self.limits.capacity) {
                return Err(RblkError::OutOfBounds {
                    position: segment.position,
                    length,
                    size: self.limits.capacity,
                });
            }
        }
        Ok(())
    }

    fn reject(&self, request: IoRequest, error: RblkError) -> Rejected {
        EngineCounters::incr(&self.counters.requests_rejected);
        debug!(target: "rblk::engine", request_id = request.request_id, error = %error, "Request rejected");
        Rejected { request, error }
    }

    /// Next sub-operation for the dispatcher.
    #[must_use]
    pub fn next_dispatch(&self) -> Option<DispatchItem> {
        self.dispatch.pop()
    }

    /// Move a sub-operation forward to `status`. Never moves backwards and
    /// never touches a terminal sub-operation.
    pub fn advance(&self, tag: OpTag, status: SubOpStatus) {
        let mut shard = self.shard(tag.request_id);
        let Some(sub) = shard
            .get_mut(&tag.request_id)
            .filter(|pending| pending.generation == tag.generation)
            .and_then(|pending| pending.sub_operations.get_mut(tag.sub_index as usize))
        else {
            return;
        };
        if !status.is_terminal() && status.rank() > sub.status.rank() {
            sub.status = status;
        }
    }

    #[must_use]
    pub fn sub_status(&self, tag: OpTag) -> Option<SubOpStatus> {
        let shard = self.shard(tag.request_id);
        shard
            .get(&tag.request_id)
            .filter(|pending| pending.generation == tag.generation)
            .and_then(|pending| pending.sub_operations.get(tag.sub_index as usize))
            .map(|sub| sub.status)
    }

    /// Apply one transport completion.
    ///
    /// Read data is moved into the segment. A completion for a sub-operation
    /// that already completed is logged and ignored; one that matches no
    /// pending request or generation is logged as stale. Neither changes
    /// any pending count.
    pub fn complete_sub_operation(
        &self,
        tag: OpTag,
        status: OpStatus,
        payload: Option<Bytes>,
    ) -> CompletionOutcome {
        let (outcome, finished) = {
            let mut shard = self.shard(tag.request_id);
            let Some(pending) = shard
                .get_mut(&tag.request_id)
                .filter(|pending| pending.generation == tag.generation)
            else {
                return self.stale(tag, "no pending request with this generation");
            };
            let Some(sub) = pending.sub_operations.get_mut(tag.sub_index as usize) else {
                return self.stale(tag, "sub-operation index out of range");
            };
            if sub.status.is_terminal() {
                warn!(
                    target: "rblk::engine",
                    request_id = tag.request_id,
                    sub_index = tag.sub_index,
                    status = ?sub.status,
                    "Duplicate completion ignored"
                );
                EngineCounters::incr(&self.counters.duplicate_completions);
                return CompletionOutcome::Duplicate;
            }

            let succeeded = apply(tag, sub, status, payload);
            let (opcode, position, length) = (sub.segment.opcode, sub.segment.position, sub.segment.length);
            if !succeeded {
                pending.failed = true;
                EngineCounters::incr(&self.counters.sub_op_errors);
            }

            let previous = pending
                .pending_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
            let finished = match previous {
                Ok(1) => shard.remove(&tag.request_id),
                Ok(_) => None,
                Err(_) => {
                    error!(target: "rblk::engine", request_id = tag.request_id, "Pending count already zero");
                    return CompletionOutcome::Duplicate;
                },
            };
            let outcome = CompletionOutcome::Applied {
                opcode,
                position,
                length,
                succeeded,
                finalized: finished.is_some(),
            };
            (outcome, finished)
        };

        if let Some(pending) = finished {
            self.finalize(tag.request_id, pending);
        }
        outcome
    }

    /// Complete a sub-operation as failed without a transport completion.
    pub fn fail_sub_operation(&self, tag: OpTag) -> CompletionOutcome {
        self.complete_sub_operation(tag, OpStatus::Failed, None)
    }

    /// Fail every sub-operation still waiting for the dispatcher.
    pub fn fail_undispatched(&self) -> usize {
        let mut failed = 0;
        while let Some(item) = self.dispatch.pop() {
            self.fail_sub_operation(item.tag);
            failed += 1;
        }
        failed
    }

    /// Finalize every pending request with an I/O error. Sub-operations
    /// still in flight are logged; their late completions will be stale.
    pub fn abandon_all(&self) -> usize {
        let mut abandoned = Vec::new();
        for shard in &self.shards {
            abandoned.extend(shard.lock().unwrap_or_else(PoisonError::into_inner).drain());
        }
        let count = abandoned.len();
        for (request_id, mut pending) in abandoned {
            let mut outstanding = 0;
            for sub in &mut pending.sub_operations {
                if !sub.status.is_terminal() {
                    sub.status = SubOpStatus::Error;
                    outstanding += 1;
                }
            }
            error!(
                target: "rblk::engine",
                request_id,
                outstanding,
                "Abandoning request with sub-operations outstanding"
            );
            pending.failed = true;
            EngineCounters::incr(&self.counters.abandoned);
            self.finalize(request_id, pending);
        }
        count
    }

    fn stale(&self, tag: OpTag, reason: &'static str) -> CompletionOutcome {
        warn!(
            target: "rblk::engine",
            request_id = tag.request_id,
            generation = tag.generation,
            sub_index = tag.sub_index,
            reason,
            "Stale completion ignored"
        );
        EngineCounters::incr(&self.counters.stale_completions);
        CompletionOutcome::Stale
    }

    fn finalize(&self, request_id: u64, pending: PendingRequest) {
        let pending_now = self.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        EngineCounters::set(&self.counters.pending_requests, pending_now as u64);
        let status = if pending.failed {
            RequestStatus::IoError
        } else {
            RequestStatus::Ok
        };
        let segments = pending.sub_operations.into_iter().map(|sub| sub.segment).collect();
        self.finish(request_id, status, segments);
    }

    fn finish(&self, request_id: u64, status: RequestStatus, segments: Vec<Segment>) {
        EngineCounters::incr(&self.counters.requests_completed);
        if status == RequestStatus::IoError {
            EngineCounters::incr(&self.counters.requests_failed);
        }
        trace!(target: "rblk::engine", request_id, ?status, "Request finalized");
        self.sink.finalize(CompletedRequest {
            request_id,
            status,
            segments,
        });
    }

    fn shard(&self, request_id: u64) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.shards[(request_id % INDEX_SHARDS as u64) as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply(tag: OpTag, sub: &mut SubOperation, status: OpStatus, payload: Option<Bytes>) -> bool {
    let succeeded = match (status, sub.segment.opcode) {
        (OpStatus::Failed, _) => false,
        // The remote side is authoritative for evicted pages.
        (OpStatus::Success, Opcode::Write) => true,
        (OpStatus::Success, Opcode::Read) => match payload {
            Some(data) if data.len() == sub.segment.length => {
                sub.segment.data = data;
                true
            },
            other => {
                warn!(
                    target: "rblk::engine",
                    request_id = tag.request_id,
                    sub_index = tag.sub_index,
                    expected = sub.segment.length,
                    received = other.map_or(0, |data| data.len()),
                    "Read completion with wrong payload length"
                );
                false
            },
        },
    };
    sub.status = if succeeded {
        SubOpStatus::Acked
    } else {
        SubOpStatus::Error
    };
    succeeded
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    const CAPACITY: u64 = 1024 * 1024;

    fn limits() -> TrackerLimits {
        TrackerLimits {
            max_segments: 8,
            max_segment_size: 8192,
            dispatch_queue_capacity: 16,
            capacity: CAPACITY,
        }
    }

    fn tracker_with(limits: TrackerLimits) -> (Tracker, Arc<Mutex<Vec<CompletedRequest>>>) {
        let finalized = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&finalized);
        let sink: Arc<dyn CompletionSink> =
            Arc::new(move |completed: CompletedRequest| seen.lock().unwrap().push(completed));
        let tracker = Tracker::new(limits, sink, Arc::new(EngineCounters::new()));
        (tracker, finalized)
    }

    fn drain(tracker: &Tracker) -> Vec<DispatchItem> {
        std::iter::from_fn(|| tracker.next_dispatch()).collect()
    }

    #[test]
    fn test_out_of_order_completion_finalizes_once() {
        let (tracker, finalized) = tracker_with(limits());
        let request = IoRequest::new(
            1,
            vec![
                Segment::read(0, 4096),
                Segment::read(8192, 4096),
                Segment::write(4096, vec![7u8; 4096]),
            ],
        );
        tracker.submit(request).unwrap();

        let items = drain(&tracker);
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].opcode, Opcode::Write);
        assert_eq!(items[2].payload.len(), 4096);

        let outcome = tracker.complete_sub_operation(items[2].tag, OpStatus::Success, None);
        assert!(matches!(outcome, CompletionOutcome::Applied { finalized: false, .. }));
        tracker.complete_sub_operation(
            items[0].tag,
            OpStatus::Success,
            Some(Bytes::from(vec![1u8; 4096])),
        );
        assert!(finalized.lock().unwrap().is_empty());

        let outcome = tracker.complete_sub_operation(
            items[1].tag,
            OpStatus::Success,
            Some(Bytes::from(vec![2u8; 4096])),
        );
        assert!(matches!(outcome, CompletionOutcome::Applied { finalized: true, .. }));

        let done = finalized.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].request_id, 1);
        assert_eq!(done[0].status, RequestStatus::Ok);
        assert_eq!(done[0].segments[0].data.as_ref(), &[1u8; 4096][..]);
        assert_eq!(done[0].segments[1].data.as_ref(), &[2u8; 4096][..]);
        assert_eq!(tracker.pending_requests(), 0);
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let (tracker, finalized) = tracker_with(limits());
        tracker
            .submit(IoRequest::new(
                5,
                vec![Segment::write(0, vec![0u8; 512]), Segment::write(512, vec![0u8; 512])],
            ))
            .unwrap();
        let items = drain(&tracker);

        tracker.complete_sub_operation(items[0].tag, OpStatus::Success, None);
        let again = tracker.complete_sub_operation(items[0].tag, OpStatus::Success, None);
        assert_eq!(again, CompletionOutcome::Duplicate);
        assert!(finalized.lock().unwrap().is_empty());
        assert_eq!(tracker.sub_status(items[1].tag), Some(SubOpStatus::Idle));

        tracker.complete_sub_operation(items[1].tag, OpStatus::Success, None);
        assert_eq!(finalized.lock().unwrap().len(), 1);

        // Entry is gone once finalized.
        let late = tracker.complete_sub_operation(items[1].tag, OpStatus::Success, None);
        assert_eq!(late, CompletionOutcome::Stale);
        assert_eq!(finalized.lock().unwrap().len(), 1);
        assert_eq!(tracker.counters.duplicate_completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stale_generation_does_not_touch_reused_id() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(7, vec![Segment::read(0, 64)])).unwrap();
        let first = drain(&tracker).remove(0);
        tracker.complete_sub_operation(first.tag, OpStatus::Success, Some(Bytes::from(vec![0u8; 64])));

        tracker.submit(IoRequest::new(7, vec![Segment::read(0, 64)])).unwrap();
        let second = drain(&tracker).remove(0);
        assert_ne!(first.tag.generation, second.tag.generation);

        let outcome = tracker.complete_sub_operation(first.tag, OpStatus::Success, None);
        assert_eq!(outcome, CompletionOutcome::Stale);
        assert_eq!(tracker.sub_status(second.tag), Some(SubOpStatus::Idle));
        assert_eq!(finalized.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_segment_limit_rejects_without_dispatch() {
        let (tracker, finalized) = tracker_with(limits());
        let segments = (0..9).map(|i| Segment::read(i * 64, 64)).collect();
        let rejected = tracker.submit(IoRequest::new(3, segments)).unwrap_err();
        assert!(matches!(rejected.error, RblkError::SegmentLimit { segments: 9, max: 8 }));
        assert!(!rejected.is_busy());
        assert_eq!(rejected.request.len(), 9);
        assert_eq!(tracker.dispatch_backlog(), 0);
        assert_eq!(tracker.pending_requests(), 0);
        assert!(finalized.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_request_finalizes_immediately() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(9, Vec::new())).unwrap();
        let done = finalized.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].is_ok());
        assert_eq!(tracker.dispatch_backlog(), 0);
    }

    #[test]
    fn test_full_dispatch_queue_is_busy() {
        let (tracker, _) = tracker_with(TrackerLimits {
            dispatch_queue_capacity: 4,
            ..limits()
        });
        let three = (0..3).map(|i| Segment::read(i * 64, 64)).collect();
        tracker.submit(IoRequest::new(1, three)).unwrap();

        let two: Vec<_> = (0..2).map(|i| Segment::read(i * 64, 64)).collect();
        let rejected = tracker.submit(IoRequest::new(2, two)).unwrap_err();
        assert!(rejected.is_busy());
        assert_eq!(tracker.pending_requests(), 1);

        drain(&tracker);
        tracker.submit(rejected.request).unwrap();
        assert_eq!(tracker.dispatch_backlog(), 2);
    }

    #[test]
    fn test_bounds_checked_at_submit() {
        let (tracker, _) = tracker_with(limits());
        let past_end = IoRequest::new(1, vec![Segment::read(CAPACITY - 100, 200)]);
        assert!(matches!(
            tracker.submit(past_end).unwrap_err().error,
            RblkError::OutOfBounds { size: CAPACITY, .. }
        ));

        let oversized = IoRequest::new(2, vec![Segment::read(0, 8193)]);
        assert!(matches!(
            tracker.submit(oversized).unwrap_err().error,
            RblkError::OutOfBounds { size: 8192, .. }
        ));

        let wrapping = IoRequest::new(3, vec![Segment::read(u64::MAX - 10, 64)]);
        assert!(tracker.submit(wrapping).is_err());
        assert_eq!(tracker.counters.requests_rejected.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_failed_sub_operation_fails_request_after_all_complete() {
        let (tracker, finalized) = tracker_with(limits());
        tracker
            .submit(IoRequest::new(4, vec![Segment::read(0, 64), Segment::read(64, 64)]))
            .unwrap();
        let items = drain(&tracker);

        tracker.fail_sub_operation(items[0].tag);
        assert!(finalized.lock().unwrap().is_empty());
        tracker.complete_sub_operation(items[1].tag, OpStatus::Success, Some(Bytes::from(vec![3u8; 64])));

        let done = finalized.lock().unwrap();
        assert_eq!(done[0].status, RequestStatus::IoError);
        assert_eq!(done[0].segments[1].data.len(), 64);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(4, vec![Segment::read(0, 64)])).unwrap();
        let item = drain(&tracker).remove(0);
        let outcome =
            tracker.complete_sub_operation(item.tag, OpStatus::Success, Some(Bytes::from(vec![0u8; 10])));
        assert!(matches!(outcome, CompletionOutcome::Applied { succeeded: false, .. }));
        assert_eq!(finalized.lock().unwrap()[0].status, RequestStatus::IoError);
    }

    #[test]
    fn test_duplicate_request_id_rejected_while_pending() {
        let (tracker, _) = tracker_with(limits());
        tracker.submit(IoRequest::new(11, vec![Segment::read(0, 64)])).unwrap();
        let rejected = tracker.submit(IoRequest::new(11, vec![Segment::read(0, 64)])).unwrap_err();
        assert!(matches!(rejected.error, RblkError::DuplicateRequest(11)));
        assert_eq!(tracker.dispatch_backlog(), 1);
    }

    #[test]
    fn test_empty_request_with_pending_id_rejected() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(13, vec![Segment::read(0, 64)])).unwrap();
        let rejected = tracker.submit(IoRequest::new(13, Vec::new())).unwrap_err();
        assert!(matches!(rejected.error, RblkError::DuplicateRequest(13)));
        assert!(finalized.lock().unwrap().is_empty());
        assert_eq!(tracker.pending_requests(), 1);

        let item = tracker.next_dispatch().unwrap();
        tracker.complete_sub_operation(item.tag, OpStatus::Success, Some(Bytes::from(vec![0u8; 64])));
        let done = finalized.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, RequestStatus::Ok);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (tracker, _) = tracker_with(limits());
        tracker.submit(IoRequest::new(12, vec![Segment::read(0, 64)])).unwrap();
        let item = drain(&tracker).remove(0);

        tracker.advance(item.tag, SubOpStatus::Pushed);
        tracker.advance(item.tag, SubOpStatus::Started);
        assert_eq!(tracker.sub_status(item.tag), Some(SubOpStatus::Pushed));
    }

    #[test]
    fn test_abandon_and_close() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(20, vec![Segment::read(0, 64)])).unwrap();
        tracker.submit(IoRequest::new(21, vec![Segment::read(0, 64), Segment::read(64, 64)])).unwrap();
        let items = drain(&tracker);
        tracker.complete_sub_operation(items[1].tag, OpStatus::Success, Some(Bytes::from(vec![0u8; 64])));

        tracker.close();
        let rejected = tracker.submit(IoRequest::new(22, vec![Segment::read(0, 64)])).unwrap_err();
        assert!(matches!(rejected.error, RblkError::ShuttingDown));

        assert_eq!(tracker.abandon_all(), 2);
        let done = finalized.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.status == RequestStatus::IoError));
        assert_eq!(tracker.pending_requests(), 0);

        drop(done);
        let late = tracker.complete_sub_operation(items[0].tag, OpStatus::Success, None);
        assert_eq!(late, CompletionOutcome::Stale);
    }

    #[test]
    fn test_fail_undispatched() {
        let (tracker, finalized) = tracker_with(limits());
        tracker.submit(IoRequest::new(30, vec![Segment::read(0, 64), Segment::read(64, 64)])).unwrap();
        assert_eq!(tracker.fail_undispatched(), 2);
        let done = finalized.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, RequestStatus::IoError);
    }
}
