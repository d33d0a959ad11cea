use crate::{Completion, OpTag, Transport, TransportKind};
use bytes::Bytes;
use rblk_core::{RblkError, Result, TaskDescriptor, TaskKind};
use rblk_ring::{AreaConsumer, AreaProducer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

/// Sends sub-operations to a peer through a pair of shared fault areas:
/// requests go out on `to_peer`, acknowledgements come back on `from_peer`.
#[derive(Debug)]
pub struct RingTransport {
    to_peer: Mutex<AreaProducer>,
    from_peer: Mutex<AreaConsumer>,
    depth: usize,
    capacity: u64,
    max_write: usize,
    max_read: usize,
    closed: AtomicBool,
    /// Set by whoever runs the peer once it has stopped on an error.
    peer_failed: Option<Arc<AtomicBool>>,
}

impl RingTransport {
    /// `capacity` is the size of the memory the peer serves.
    #[must_use]
    pub fn new(to_peer: AreaProducer, from_peer: AreaConsumer, capacity: u64) -> Self {
        let out = to_peer.area().layout();
        let back = from_peer.area().layout();
        // Every in-flight request must be able to get its ack back.
        let depth = out.usable_slots().min(back.usable_slots());
        debug!(target: "rblk::io", depth, capacity, "Ring transport ready");
        Self {
            to_peer: Mutex::new(to_peer),
            from_peer: Mutex::new(from_peer),
            depth,
            capacity,
            max_write: out.byte_capacity - 1,
            max_read: back.byte_capacity - 1,
            closed: AtomicBool::new(false),
            peer_failed: None,
        }
    }

    /// Fail issues and polls once `failed` is set. Acks the peer pushed
    /// before failing are still delivered.
    #[must_use]
    pub fn watch_peer(mut self, failed: Arc<AtomicBool>) -> Self {
        self.peer_failed = Some(failed);
        self
    }

    fn peer_failed(&self) -> bool {
        self.peer_failed
            .as_ref()
            .is_some_and(|failed| failed.load(Ordering::Acquire))
    }

    fn producer(&self) -> Result<MutexGuard<'_, AreaProducer>> {
        if self.closed.load(Ordering::Acquire) || self.peer_failed() {
            return Err(RblkError::Disconnected);
        }
        self.to_peer
            .lock()
            .map_err(|_| RblkError::Remote("ring producer lock poisoned".into()))
    }

    fn check_length(&self, position: u64, length: usize, limit: usize) -> Result<()> {
        if length > limit {
            return Err(RblkError::OutOfBounds {
                position,
                length: length as u64,
                size: limit as u64,
            });
        }
        Ok(())
    }
}

impl Transport for RingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ring
    }

    fn queue_depth(&self) -> usize {
        self.depth
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn issue_read(&self, tag: OpTag, position: u64, length: usize) -> Result<()> {
        self.check_length(position, length, self.max_read)?;
        let task = TaskDescriptor::new(
            TaskKind::FaultOnly,
            tag.request_id,
            tag.generation,
            tag.sub_index,
            position,
            length as u64,
        );
        if self.producer()?.push_task(&task) {
            Ok(())
        } else {
            Err(RblkError::QueueFull("ring task queue"))
        }
    }

    fn issue_write(&self, tag: OpTag, position: u64, data: &[u8]) -> Result<()> {
        self.check_length(position, data.len(), self.max_write)?;
        let mut producer = self.producer()?;
        // Payload bytes are only committed once a slot is known to be free.
        if !producer.has_free_slot() {
            return Err(RblkError::QueueFull("ring task queue"));
        }
        let offset = producer
            .copy_to_ring(data)
            .ok_or(RblkError::QueueFull("ring byte buffer"))?;

        let task = TaskDescriptor::new(
            TaskKind::EvictionNeeded,
            tag.request_id,
            tag.generation,
            tag.sub_index,
            position,
            data.len() as u64,
        )
        .with_payload_offset(offset);
        if producer.push_task(&task) {
            Ok(())
        } else {
            error!(target: "rblk::io", request_id = tag.request_id, "Ring slot vanished after payload copy");
            Err(RblkError::ProtocolCorruption(
                "task queue filled by another producer".into(),
            ))
        }
    }

    fn poll_completion(&self) -> Result<Option<Completion>> {
        let mut consumer = self
            .from_peer
            .lock()
            .map_err(|_| RblkError::Remote("ring consumer lock poisoned".into()))?;
        let Some(ack) = consumer.pop_task()? else {
            if self.peer_failed() {
                return Err(RblkError::Disconnected);
            }
            return Ok(None);
        };

        let tag = OpTag {
            request_id: ack.request_id(),
            generation: ack.generation(),
            sub_index: ack.sub_index(),
        };
        let completion = match ack.kind()? {
            TaskKind::FaultOnly => {
                let len = usize::try_from(ack.size()).map_err(|_| {
                    RblkError::ProtocolCorruption(format!("ack size {} too large", ack.size()))
                })?;
                let mut data = vec![0u8; len];
                consumer.copy_from_ring(ack.payload_offset(), &mut data)?;
                Completion::success(tag, Some(Bytes::from(data)))
            },
            TaskKind::EvictionNeeded => Completion::success(tag, None),
            TaskKind::Failed => Completion::failed(tag),
        };
        Ok(Some(completion))
    }

    fn shutdown(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target: "rblk::io", "Ring transport closed");
        }
        Ok(())
    }
}
