use crate::area::{FaultArea, load_index};
use rblk_core::{RblkError, Result, TaskDescriptor};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, warn};

/// Producer end of a [`FaultArea`]: advances the queue tail and the byte
/// ring head.
#[derive(Debug)]
pub struct AreaProducer {
    area: Arc<FaultArea>,
}

impl AreaProducer {
    pub(crate) fn new(area: Arc<FaultArea>) -> Self {
        Self { area }
    }

    #[must_use]
    pub fn area(&self) -> &Arc<FaultArea> {
        &self.area
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        let header = self.area.header();
        let slots = self.area.layout().queue_slots;
        let head = load_index(&header.queue_head);
        let tail = header.queue_tail.load(Ordering::Relaxed) as usize;
        (tail + 1) % slots != head
    }

    /// Append a descriptor. Returns `false` without touching the queue when
    /// it is full.
    pub fn push_task(&mut self, task: &TaskDescriptor) -> bool {
        if !self.has_free_slot() {
            return false;
        }
        let header = self.area.header();
        let tail = header.queue_tail.load(Ordering::Relaxed) as usize;

        let mut slot = *task;
        slot.set_processed(false);
        // SAFETY: the slot at tail is outside [head, tail) and so owned by the producer
        unsafe { self.area.slot_ptr(tail).write(slot) };

        // Release orders the slot write before the consumer can observe the new tail.
        let next = (tail + 1) % self.area.layout().queue_slots;
        header.queue_tail.store(next as u64, Ordering::Release);
        true
    }

    /// Free space in the byte ring, keeping one byte unused.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let header = self.area.header();
        let capacity = self.area.layout().byte_capacity;
        let head = header.byte_head.load(Ordering::Relaxed) as usize;
        let tail = load_index(&header.byte_tail);
        let used = (head + capacity - tail) % capacity;
        capacity - 1 - used
    }

    /// Copy a payload into the byte ring, wrapping at the end of the buffer.
    /// Returns the offset the payload starts at, or `None` without a partial
    /// write when it does not fit.
    pub fn copy_to_ring(&mut self, data: &[u8]) -> Option<u64> {
        if data.len() > self.free_bytes() {
            return None;
        }
        let header = self.area.header();
        let capacity = self.area.layout().byte_capacity;
        let head = header.byte_head.load(Ordering::Relaxed) as usize;

        let first = data.len().min(capacity - head);
        let bytes = self.area.bytes_ptr();
        // SAFETY: [head, head+len) mod capacity lies in the free region checked
        // above, which only the producer writes
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), bytes.add(head), first);
            std::ptr::copy_nonoverlapping(data.as_ptr().add(first), bytes, data.len() - first);
        }

        let next = (head + data.len()) % capacity;
        header.byte_head.store(next as u64, Ordering::Release);
        Some(head as u64)
    }
}

impl Drop for AreaProducer {
    fn drop(&mut self) {
        self.area.release_producer();
    }
}

/// Consumer end of a [`FaultArea`]: advances the queue head and the byte
/// ring tail.
#[derive(Debug)]
pub struct AreaConsumer {
    area: Arc<FaultArea>,
}

impl AreaConsumer {
    pub(crate) fn new(area: Arc<FaultArea>) -> Self {
        Self { area }
    }

    #[must_use]
    pub fn area(&self) -> &Arc<FaultArea> {
        &self.area
    }

    /// Take the oldest descriptor, or `None` when the queue is empty.
    ///
    /// The consumed slot is overwritten with a processed tombstone, so a
    /// producer that publishes a slot without writing it is detected.
    ///
    /// # Errors
    /// Returns `ProtocolCorruption` if the slot at the head was already
    /// processed. The head does not move in that case.
    pub fn pop_task(&mut self) -> Result<Option<TaskDescriptor>> {
        let header = self.area.header();
        let head = header.queue_head.load(Ordering::Relaxed) as usize;
        let tail = load_index(&header.queue_tail);
        if head == tail {
            return Ok(None);
        }

        let slot = self.area.slot_ptr(head);
        // SAFETY: head != tail, so the slot was published by the producer's release store
        let task = unsafe { slot.read() };
        if task.is_processed() {
            let request_id = task.request_id();
            error!(
                target: "rblk::ring",
                slot = head,
                request_id,
                "Descriptor already processed"
            );
            return Err(RblkError::ProtocolCorruption(format!(
                "slot {head} already processed (request {request_id})"
            )));
        }

        // SAFETY: the slot stays owned by the consumer until head advances
        unsafe { slot.write(TaskDescriptor::consumed()) };

        let next = (head + 1) % self.area.layout().queue_slots;
        header.queue_head.store(next as u64, Ordering::Release);
        Ok(Some(task))
    }

    /// Copy `dst.len()` payload bytes out of the byte ring and release them.
    ///
    /// `offset` is where the producer reported the payload; reads always
    /// start there. An offset past the ring's own tail is logged and the
    /// bytes in between are released along with the payload.
    ///
    /// # Errors
    /// Returns `ProtocolCorruption` if the offset is outside the ring or the
    /// range `[offset, offset + dst.len())` is not entirely published. The
    /// tail does not move in that case.
    pub fn copy_from_ring(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let header = self.area.header();
        let capacity = self.area.layout().byte_capacity;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|&o| o < capacity)
            .ok_or_else(|| {
                RblkError::ProtocolCorruption(format!(
                    "payload offset {offset} outside byte ring of {capacity}"
                ))
            })?;

        let tail = header.byte_tail.load(Ordering::Relaxed) as usize;
        let head = load_index(&header.byte_head);
        let used = (head + capacity - tail) % capacity;
        let skipped = (offset + capacity - tail) % capacity;
        if skipped + dst.len() > used {
            return Err(RblkError::ProtocolCorruption(format!(
                "payload of {} bytes at offset {offset} runs past published bytes {tail}..{head}",
                dst.len()
            )));
        }
        if skipped != 0 {
            warn!(
                target: "rblk::ring",
                offset,
                tail,
                skipped,
                "Reading payload from non-tail location"
            );
        }

        let first = dst.len().min(capacity - offset);
        let bytes = self.area.bytes_ptr();
        let rest = dst.len() - first;
        // SAFETY: [offset, offset + len) lies inside [tail, head), which the
        // producer published and does not rewrite until the tail moves past it
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.add(offset), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(bytes, dst.as_mut_ptr().add(first), rest);
        }

        let next = (offset + dst.len()) % capacity;
        header.byte_tail.store(next as u64, Ordering::Release);
        Ok(())
    }
}

impl Drop for AreaConsumer {
    fn drop(&mut self) {
        self.area.release_consumer();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::RingLayout;
    use rblk_core::TaskKind;

    fn pair(slots: usize, bytes: usize) -> (AreaProducer, AreaConsumer) {
        let area = FaultArea::create(RingLayout::new(slots, bytes)).unwrap();
        (area.producer().unwrap(), area.consumer().unwrap())
    }

    fn task(id: u64) -> TaskDescriptor {
        TaskDescriptor::new(TaskKind::FaultOnly, id, 0, 0, 0, 4096)
    }

    #[test]
    fn test_capacity_four_holds_three() {
        let (mut producer, mut consumer) = pair(4, 64);

        assert!(producer.push_task(&task(1)));
        assert!(producer.push_task(&task(2)));
        assert!(producer.push_task(&task(3)));
        assert!(!producer.push_task(&task(4)));
        assert_eq!(producer.area().queued_tasks(), 3);

        assert_eq!(consumer.pop_task().unwrap().unwrap().request_id(), 1);
        assert!(producer.push_task(&task(4)));

        for expected in 2..=4 {
            assert_eq!(consumer.pop_task().unwrap().unwrap().request_id(), expected);
        }
        assert!(consumer.pop_task().unwrap().is_none());
    }

    #[test]
    fn test_popped_task_has_clear_processed_flag() {
        let (mut producer, mut consumer) = pair(4, 64);
        let mut stale = task(9);
        stale.set_processed(true);

        assert!(producer.push_task(&stale));
        let popped = consumer.pop_task().unwrap().unwrap();
        assert!(!popped.is_processed());
        assert_eq!(popped.request_id(), 9);
    }

    #[test]
    fn test_byte_ring_wraps() {
        let (mut producer, mut consumer) = pair(4, 16);

        let first = producer.copy_to_ring(&[1u8; 10]).unwrap();
        assert_eq!(first, 0);
        let mut out = [0u8; 10];
        consumer.copy_from_ring(first, &mut out).unwrap();

        let payload: Vec<u8> = (0..12).collect();
        let offset = producer.copy_to_ring(&payload).unwrap();
        assert_eq!(offset, 10);

        let mut back = vec![0u8; 12];
        consumer.copy_from_ring(offset, &mut back).unwrap();
        assert_eq!(back, payload);
        assert_eq!(producer.area().bytes_in_use(), 0);
    }

    #[test]
    fn test_byte_ring_full_leaves_state_untouched() {
        let (mut producer, _consumer) = pair(4, 16);

        assert_eq!(producer.free_bytes(), 15);
        assert!(producer.copy_to_ring(&[7u8; 16]).is_none());
        assert_eq!(producer.free_bytes(), 15);

        assert!(producer.copy_to_ring(&[7u8; 15]).is_some());
        assert_eq!(producer.free_bytes(), 0);
        assert!(producer.copy_to_ring(&[7u8; 1]).is_none());
    }

    #[test]
    fn test_read_past_published_bytes_is_corruption() {
        let (mut producer, mut consumer) = pair(4, 32);
        let offset = producer.copy_to_ring(&[3u8; 4]).unwrap();

        let mut out = [0u8; 8];
        assert!(matches!(
            consumer.copy_from_ring(offset, &mut out),
            Err(RblkError::ProtocolCorruption(_))
        ));
        assert!(consumer.copy_from_ring(64, &mut out[..1]).is_err());
    }

    #[test]
    fn test_offset_mismatch_still_reads() {
        let (mut producer, mut consumer) = pair(4, 32);
        producer.copy_to_ring(&[1u8; 4]).unwrap();
        let second = producer.copy_to_ring(&[2u8; 4]).unwrap();

        // Reading the second payload first is tolerated and logged; the
        // skipped payload is released with it.
        let mut out = [0u8; 4];
        consumer.copy_from_ring(second, &mut out).unwrap();
        assert_eq!(out, [2u8; 4]);
        assert_eq!(producer.area().bytes_in_use(), 0);
    }

    #[test]
    fn test_read_from_offset_bounded_by_published_bytes() {
        let (mut producer, mut consumer) = pair(4, 32);
        producer.copy_to_ring(&[1u8; 4]).unwrap();
        let second = producer.copy_to_ring(&[2u8; 4]).unwrap();
        assert_eq!(second, 4);

        // Only 4 bytes are published from offset 4.
        let mut out = [0xAAu8; 8];
        assert!(matches!(
            consumer.copy_from_ring(second, &mut out),
            Err(RblkError::ProtocolCorruption(_))
        ));
        assert_eq!(out, [0xAAu8; 8]);
        assert_eq!(producer.area().bytes_in_use(), 8);

        // An offset beyond the head is never published.
        assert!(matches!(
            consumer.copy_from_ring(20, &mut out[..4]),
            Err(RblkError::ProtocolCorruption(_))
        ));
        assert_eq!(producer.area().bytes_in_use(), 8);

        let mut all = [0u8; 8];
        consumer.copy_from_ring(0, &mut all).unwrap();
        assert_eq!(all, [1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(producer.area().bytes_in_use(), 0);
    }
}
