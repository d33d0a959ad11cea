use crate::{Completion, OpTag, Transport, TransportKind};
use bytes::Bytes;
use rblk_core::{RblkError, Result};
use rblk_net::{Connection, WcOpcode};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Copy)]
enum Staged<'a> {
    Read(usize),
    Write(&'a [u8]),
}

#[derive(Debug)]
struct InflightOp {
    tag: OpTag,
    slot: usize,
    opcode: WcOpcode,
    len: usize,
}

/// Issues sub-operations as one-sided reads and writes. Each in-flight
/// operation owns one fixed-size staging slot of the connection's local
/// region, so the slot count equals the negotiated queue depth.
pub struct FabricTransport {
    connection: Connection,
    slot_size: usize,
    free_slots: Mutex<Vec<usize>>,
    inflight: Mutex<HashMap<u64, InflightOp>>,
    drain_timeout: Duration,
}

impl FabricTransport {
    /// # Errors
    /// Returns `Config` if the local region cannot hold one slot of
    /// `slot_size` bytes per queue-depth entry.
    pub fn new(connection: Connection, slot_size: usize, drain_timeout: Duration) -> Result<Self> {
        let slots = connection.queue_depth() as usize;
        let needed = slots * slot_size;
        if slot_size == 0 || connection.local_region().len() < needed {
            return Err(RblkError::Config(format!(
                "local region of {} bytes cannot stage {slots} slots of {slot_size} bytes",
                connection.local_region().len()
            )));
        }
        debug!(target: "rblk::io", peer = connection.peer(), slots, slot_size, "Fabric transport ready");
        Ok(Self {
            connection,
            slot_size,
            free_slots: Mutex::new((0..slots).rev().collect()),
            inflight: Mutex::new(HashMap::with_capacity(slots)),
            drain_timeout,
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Bytes needed in the local region for `depth` slots of `slot_size`.
    #[must_use]
    pub fn staging_len(depth: u32, slot_size: usize) -> usize {
        depth as usize * slot_size
    }

    fn take_slot(&self) -> Result<usize> {
        lock(&self.free_slots)?
            .pop()
            .ok_or(RblkError::QueueFull("fabric staging slots"))
    }

    fn release_slot(&self, slot: usize) {
        if let Ok(mut free) = self.free_slots.lock() {
            free.push(slot);
        }
    }

    fn issue(&self, tag: OpTag, position: u64, staged: Staged<'_>) -> Result<()> {
        let (opcode, len) = match staged {
            Staged::Read(len) => (WcOpcode::Read, len),
            Staged::Write(bytes) => (WcOpcode::Write, bytes.len()),
        };
        if len > self.slot_size {
            return Err(RblkError::OutOfBounds {
                position,
                length: len as u64,
                size: self.slot_size as u64,
            });
        }
        let remote = self.connection.remote();
        let address = remote.address_of(position, len as u64)?;
        let slot = self.take_slot()?;
        let local_offset = slot * self.slot_size;

        if let Staged::Write(bytes) = staged {
            if let Err(e) = self.connection.local_region().write(local_offset, bytes) {
                self.release_slot(slot);
                return Err(e);
            }
        }

        let wr_id = self.connection.next_wr_id();
        lock(&self.inflight)?.insert(
            wr_id,
            InflightOp {
                tag,
                slot,
                opcode,
                len,
            },
        );

        let qp = self.connection.queue_pair();
        let posted = match opcode {
            WcOpcode::Read => qp.post_read(wr_id, local_offset, address, len, remote.access_token),
            WcOpcode::Write => qp.post_write(wr_id, local_offset, address, len, remote.access_token),
        };
        if let Err(e) = posted {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&wr_id);
            }
            self.release_slot(slot);
            return Err(e);
        }
        Ok(())
    }
}

impl Transport for FabricTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fabric
    }

    fn queue_depth(&self) -> usize {
        self.connection.queue_depth() as usize
    }

    fn capacity(&self) -> u64 {
        self.connection.remote().size
    }

    fn issue_read(&self, tag: OpTag, position: u64, length: usize) -> Result<()> {
        self.issue(tag, position, Staged::Read(length))
    }

    fn issue_write(&self, tag: OpTag, position: u64, data: &[u8]) -> Result<()> {
        self.issue(tag, position, Staged::Write(data))
    }

    fn poll_completion(&self) -> Result<Option<Completion>> {
        let Some(wc) = self.connection.queue_pair().poll_cq()? else {
            return Ok(None);
        };
        let Some(op) = lock(&self.inflight)?.remove(&wc.wr_id) else {
            warn!(target: "rblk::io", wr_id = wc.wr_id, "Completion for unknown work request");
            return Ok(None);
        };

        let completion = if wc.is_success() {
            let payload = match op.opcode {
                WcOpcode::Read => {
                    let mut data = vec![0u8; op.len];
                    self.connection
                        .local_region()
                        .read(op.slot * self.slot_size, &mut data)?;
                    Some(Bytes::from(data))
                },
                WcOpcode::Write => None,
            };
            Completion::success(op.tag, payload)
        } else {
            warn!(
                target: "rblk::io",
                request_id = op.tag.request_id,
                sub_index = op.tag.sub_index,
                status = ?wc.status,
                "One-sided operation failed"
            );
            Completion::failed(op.tag)
        };
        self.release_slot(op.slot);
        Ok(Some(completion))
    }

    fn shutdown(&self) -> Result<()> {
        self.connection.disconnect(self.drain_timeout)
    }
}

impl std::fmt::Debug for FabricTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricTransport")
            .field("connection", &self.connection)
            .field("slot_size", &self.slot_size)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RblkError::Remote("fabric transport lock poisoned".into()))
}
