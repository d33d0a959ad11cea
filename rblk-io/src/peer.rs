use crate::PageStore;
use rblk_core::{Pause, RblkError, Result, RetryPolicy, TaskDescriptor, TaskKind};
use rblk_ring::{AreaConsumer, AreaProducer};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

struct PendingAck {
    task: TaskDescriptor,
    payload: Option<Vec<u8>>,
}

/// Serving side of the ring transport.
///
/// Pops requests from the engine, serves them from a [`PageStore`] and
/// pushes one acknowledgement per request. When the ack direction is full
/// the peer holds the ack and stops taking requests until it drains.
pub struct RingPeer<S: PageStore> {
    requests: AreaConsumer,
    acks: AreaProducer,
    store: S,
    pending: Option<PendingAck>,
    served: u64,
}

impl<S: PageStore> RingPeer<S> {
    #[must_use]
    pub fn new(requests: AreaConsumer, acks: AreaProducer, store: S) -> Self {
        Self {
            requests,
            acks,
            store,
            pending: None,
            served: 0,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serve up to `budget` requests. Returns how many were served.
    ///
    /// # Errors
    /// Returns `ProtocolCorruption` if the request queue is inconsistent.
    pub fn serve_once(&mut self, budget: usize) -> Result<usize> {
        let mut served = 0;
        if !self.flush_pending() {
            return Ok(0);
        }
        while served < budget {
            let Some(task) = self.requests.pop_task()? else {
                break;
            };
            self.pending = Some(self.serve(task)?);
            served += 1;
            self.served += 1;
            if !self.flush_pending() {
                break;
            }
        }
        Ok(served)
    }

    /// Serve until `stop` is set, pausing per `idle` whenever there is no work.
    ///
    /// # Errors
    /// Returns the first protocol error; the peer cannot continue after one.
    pub fn run(&mut self, stop: &AtomicBool, idle: &RetryPolicy, pause: &dyn Pause) -> Result<u64> {
        info!(target: "rblk::io", "Ring peer serving");
        while !stop.load(Ordering::Acquire) {
            if self.serve_once(64)? == 0 {
                pause.pause(idle.backoff);
            }
        }
        if self.pending.is_some() && !self.flush_pending() {
            warn!(target: "rblk::io", "Ring peer stopped with an unsent ack");
        }
        info!(target: "rblk::io", served = self.served, "Ring peer stopped");
        Ok(self.served)
    }

    fn serve(&mut self, task: TaskDescriptor) -> Result<PendingAck> {
        let Ok(len) = usize::try_from(task.size()) else {
            return Ok(Self::failure(task));
        };
        match task.kind()? {
            TaskKind::FaultOnly => {
                // A read larger than the ack ring could never be returned.
                if len >= self.acks.area().layout().byte_capacity {
                    warn!(target: "rblk::io", request_id = task.request_id(), len, "Fault larger than ack ring");
                    return Ok(Self::failure(task));
                }
                let mut data = vec![0u8; len];
                match self.store.read(task.target_offset(), &mut data) {
                    Ok(()) => Ok(PendingAck {
                        task,
                        payload: Some(data),
                    }),
                    Err(e) => {
                        warn!(target: "rblk::io", request_id = task.request_id(), error = %e, "Fault read failed");
                        Ok(Self::failure(task))
                    },
                }
            },
            TaskKind::EvictionNeeded => {
                // The payload is consumed even if the store rejects it, so
                // the byte ring stays in step with the queue.
                let mut data = vec![0u8; len];
                self.requests.copy_from_ring(task.payload_offset(), &mut data)?;
                match self.store.write(task.target_offset(), &data) {
                    Ok(()) => Ok(PendingAck {
                        task,
                        payload: None,
                    }),
                    Err(e) => {
                        warn!(target: "rblk::io", request_id = task.request_id(), error = %e, "Eviction write failed");
                        Ok(Self::failure(task))
                    },
                }
            },
            TaskKind::Failed => Err(RblkError::ProtocolCorruption(format!(
                "failure ack received as request {}",
                task.request_id()
            ))),
        }
    }

    fn failure(mut task: TaskDescriptor) -> PendingAck {
        task.set_kind(TaskKind::Failed);
        PendingAck {
            task,
            payload: None,
        }
    }

    fn flush_pending(&mut self) -> bool {
        let Some(ack) = self.pending.as_ref() else {
            return true;
        };
        if !self.acks.has_free_slot() {
            return false;
        }
        let mut task = ack.task;
        if let Some(payload) = &ack.payload {
            let Some(offset) = self.acks.copy_to_ring(payload) else {
                return false;
            };
            task = task.with_payload_offset(offset);
        }
        if !self.acks.push_task(&task) {
            return false;
        }
        debug!(target: "rblk::io", request_id = task.request_id(), sub_index = task.sub_index(), "Ack sent");
        self.pending = None;
        true
    }
}
