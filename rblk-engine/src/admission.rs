use rblk_io::OpTag;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{trace, warn};

/// Bounds sub-operations in flight to the transport's queue depth.
///
/// Every slot belongs to the [`OpTag`] that took it, and only that tag
/// can return it. A duplicate or unknown completion therefore frees
/// nothing, and the count can never pass the limit.
#[derive(Debug)]
pub struct InFlightGate {
    limit: usize,
    slots: Mutex<HashSet<OpTag>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGate {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            slots: Mutex::new(HashSet::with_capacity(limit)),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed.
    #[inline]
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Take a slot for `tag` if one is free. Must happen before the
    /// operation is issued so its completion always finds the slot.
    pub fn try_acquire(&self, tag: OpTag) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() >= self.limit {
            return false;
        }
        if !slots.insert(tag) {
            warn!(
                target: "rblk::engine",
                request_id = tag.request_id,
                sub_index = tag.sub_index,
                "Sub-operation already holds an in-flight slot"
            );
            return false;
        }
        let held = slots.len();
        self.in_flight.store(held, Ordering::Release);
        self.peak.fetch_max(held, Ordering::Relaxed);
        true
    }

    /// Return the slot held by `tag`. Returns `false` if it holds none.
    pub fn release(&self, tag: OpTag) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.remove(&tag) {
            trace!(
                target: "rblk::engine",
                request_id = tag.request_id,
                sub_index = tag.sub_index,
                "No in-flight slot to release"
            );
            return false;
        }
        self.in_flight.store(slots.len(), Ordering::Release);
        true
    }
}
