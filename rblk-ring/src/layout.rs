use crossbeam::utils::CachePadded;
use rblk_core::{
    DEFAULT_BYTE_CAPACITY, DEFAULT_QUEUE_SLOTS, RblkError, Result, TASK_DESCRIPTOR_SIZE,
};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Geometry of a fault area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Descriptor slots in the task queue; one is always left unused.
    pub queue_slots: usize,
    /// Size of the payload byte ring; one byte is always left unused.
    pub byte_capacity: usize,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            queue_slots: DEFAULT_QUEUE_SLOTS,
            byte_capacity: DEFAULT_BYTE_CAPACITY,
        }
    }
}

impl RingLayout {
    #[must_use]
    pub fn new(queue_slots: usize, byte_capacity: usize) -> Self {
        Self {
            queue_slots,
            byte_capacity,
        }
    }

    /// # Errors
    /// Returns `Config` if either ring is too small to hold a single entry.
    pub fn validate(&self) -> Result<()> {
        if self.queue_slots < 2 {
            return Err(RblkError::Config(format!(
                "queue_slots must be at least 2, got {}",
                self.queue_slots
            )));
        }
        if self.byte_capacity < 2 {
            return Err(RblkError::Config(format!(
                "byte_capacity must be at least 2, got {}",
                self.byte_capacity
            )));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn usable_slots(&self) -> usize {
        self.queue_slots - 1
    }

    #[inline]
    pub(crate) fn header_len() -> usize {
        std::mem::size_of::<AreaHeader>()
    }

    #[inline]
    pub(crate) fn bytes_offset(&self) -> usize {
        Self::header_len() + self.queue_slots * TASK_DESCRIPTOR_SIZE
    }

    /// Bytes needed to back an area with this geometry.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.bytes_offset() + self.byte_capacity
    }
}

/// Leading control block of a fault area. `version` is published last, so
/// an area whose version reads as zero is still being initialised.
#[repr(C)]
pub(crate) struct AreaHeader {
    pub version: AtomicU32,
    pub task_size: u32,
    pub queue_slots: u64,
    pub byte_capacity: u64,
    pub queue_head: CachePadded<AtomicU64>,
    pub queue_tail: CachePadded<AtomicU64>,
    pub byte_head: CachePadded<AtomicU64>,
    pub byte_tail: CachePadded<AtomicU64>,
}
