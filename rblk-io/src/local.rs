use crate::{Completion, MemoryStore, OpTag, PageStore, Transport, TransportKind};
use bytes::Bytes;
use rblk_core::{RblkError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Serves sub-operations from local memory. Data moves at issue time and
/// the completion is queued for the next poll.
#[derive(Debug)]
pub struct LocalTransport {
    store: MemoryStore,
    completions: Mutex<VecDeque<Completion>>,
    depth: usize,
    closed: AtomicBool,
}

impl LocalTransport {
    /// # Errors
    /// Returns an error if the backing memory cannot be allocated.
    pub fn new(capacity: usize, depth: usize) -> Result<Self> {
        let depth = depth.max(1);
        debug!(target: "rblk::io", capacity, depth, "Local transport ready");
        Ok(Self {
            store: MemoryStore::new(capacity)?,
            completions: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn enqueue(&self, build: impl FnOnce() -> Completion) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RblkError::Disconnected);
        }
        let mut completions = self
            .completions
            .lock()
            .map_err(|_| RblkError::Remote("completion queue lock poisoned".into()))?;
        if completions.len() >= self.depth {
            return Err(RblkError::QueueFull("local completion queue"));
        }
        completions.push_back(build());
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn queue_depth(&self) -> usize {
        self.depth
    }

    fn capacity(&self) -> u64 {
        self.store.capacity()
    }

    fn issue_read(&self, tag: OpTag, position: u64, length: usize) -> Result<()> {
        self.enqueue(|| {
            let mut data = vec![0u8; length];
            match self.store.read(position, &mut data) {
                Ok(()) => Completion::success(tag, Some(Bytes::from(data))),
                Err(e) => {
                    warn!(target: "rblk::io", request_id = tag.request_id, position, error = %e, "Local read failed");
                    Completion::failed(tag)
                },
            }
        })
    }

    fn issue_write(&self, tag: OpTag, position: u64, data: &[u8]) -> Result<()> {
        self.enqueue(|| match self.store.write(position, data) {
            Ok(()) => Completion::success(tag, None),
            Err(e) => {
                warn!(target: "rblk::io", request_id = tag.request_id, position, error = %e, "Local write failed");
                Completion::failed(tag)
            },
        })
    }

    fn poll_completion(&self) -> Result<Option<Completion>> {
        Ok(self
            .completions
            .lock()
            .map_err(|_| RblkError::Remote("completion queue lock poisoned".into()))?
            .pop_front())
    }

    fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::OpStatus;

    fn tag(sub_index: u32) -> OpTag {
        OpTag {
            request_id: 1,
            generation: 1,
            sub_index,
        }
    }

    #[test]
    fn test_write_then_read() {
        let transport = LocalTransport::new(16 * 4096, 4).unwrap();
        transport.issue_write(tag(0), 4096, &[7u8; 4096]).unwrap();
        transport.issue_read(tag(1), 4096, 4096).unwrap();

        let write = transport.poll_completion().unwrap().unwrap();
        assert_eq!(write.tag, tag(0));
        assert_eq!(write.status, OpStatus::Success);
        assert!(write.payload.is_none());

        let read = transport.poll_completion().unwrap().unwrap();
        assert_eq!(read.payload.unwrap(), Bytes::from(vec![7u8; 4096]));
        assert!(transport.poll_completion().unwrap().is_none());
    }

    #[test]
    fn test_depth_bounds_unpolled_completions() {
        let transport = LocalTransport::new(4096, 2).unwrap();
        transport.issue_read(tag(0), 0, 8).unwrap();
        transport.issue_read(tag(1), 0, 8).unwrap();
        let err = transport.issue_read(tag(2), 0, 8).unwrap_err();
        assert!(err.is_retryable());

        transport.poll_completion().unwrap().unwrap();
        transport.issue_read(tag(2), 0, 8).unwrap();
    }

    #[test]
    fn test_out_of_range_completes_failed() {
        let transport = LocalTransport::new(4096, 2).unwrap();
        transport.issue_read(tag(0), 4000, 200).unwrap();
        let completion = transport.poll_completion().unwrap().unwrap();
        assert_eq!(completion.status, OpStatus::Failed);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let transport = LocalTransport::new(4096, 2).unwrap();
        transport.shutdown().unwrap();
        transport.shutdown().unwrap();
        assert!(matches!(
            transport.issue_write(tag(0), 0, &[1]),
            Err(RblkError::Disconnected)
        ));
    }
}
