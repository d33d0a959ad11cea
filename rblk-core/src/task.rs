//! Fixed-layout task descriptor exchanged through the shared fault queues.
//!
//! Both sides of the boundary read and write this record byte-for-byte,
//! so the layout is packed and must never change without bumping
//! [`crate::FAULT_AREA_VERSION`].

use crate::{RblkError, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Serialized size of a [`TaskDescriptor`]: 5 u64 fields, 2 u32 fields, one u32 tag.
pub const TASK_DESCRIPTOR_SIZE: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskKind {
    /// Page must be fetched from remote memory.
    FaultOnly = 0,
    /// Page payload sits in the byte ring and must be written to remote memory.
    EvictionNeeded = 1,
    /// Acknowledgement for an operation the peer could not serve.
    Failed = 2,
}

impl TryFrom<u32> for TaskKind {
    type Error = RblkError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(TaskKind::FaultOnly),
            1 => Ok(TaskKind::EvictionNeeded),
            2 => Ok(TaskKind::Failed),
            other => Err(RblkError::ProtocolCorruption(format!(
                "unknown task kind tag {other}"
            ))),
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TaskDescriptor {
    request_id: u64,
    /// Byte position in remote memory.
    target_offset: u64,
    /// Non-zero once the receiving side has consumed the slot.
    processed: u32,
    kind: u32,
    /// Offset of the payload inside the companion byte ring.
    payload_offset: u64,
    /// Generation of the pending request this task belongs to.
    generation: u64,
    size: u64,
    sub_index: u32,
}

const _: () = assert!(std::mem::size_of::<TaskDescriptor>() == TASK_DESCRIPTOR_SIZE);

impl TaskDescriptor {
    #[must_use]
    pub fn new(
        kind: TaskKind,
        request_id: u64,
        generation: u64,
        sub_index: u32,
        target_offset: u64,
        size: u64,
    ) -> Self {
        Self {
            request_id,
            target_offset,
            processed: 0,
            kind: kind as u32,
            payload_offset: 0,
            generation,
            size,
            sub_index,
        }
    }

    /// Slot contents left behind by the consumer.
    #[must_use]
    pub fn consumed() -> Self {
        Self {
            processed: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_payload_offset(mut self, offset: u64) -> Self {
        self.payload_offset = offset;
        self
    }

    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    #[inline]
    #[must_use]
    pub fn target_offset(&self) -> u64 {
        self.target_offset
    }

    #[inline]
    #[must_use]
    pub fn payload_offset(&self) -> u64 {
        self.payload_offset
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn sub_index(&self) -> u32 {
        self.sub_index
    }

    /// Decode the kind tag.
    ///
    /// # Errors
    /// Returns `ProtocolCorruption` for a tag no build of this protocol writes.
    pub fn kind(&self) -> Result<TaskKind> {
        TaskKind::try_from(self.kind)
    }

    pub fn set_kind(&mut self, kind: TaskKind) {
        self.kind = kind as u32;
    }

    #[inline]
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed != 0
    }

    #[inline]
    pub fn set_processed(&mut self, processed: bool) {
        self.processed = u32::from(processed);
    }

    /// Decode a descriptor from exactly [`TASK_DESCRIPTOR_SIZE`] bytes.
    ///
    /// # Errors
    /// Returns `ProtocolCorruption` if the buffer has the wrong length.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Self::read_from_bytes(buf).map_err(|_| {
            RblkError::ProtocolCorruption(format!(
                "task descriptor needs {TASK_DESCRIPTOR_SIZE} bytes, got {}",
                buf.len()
            ))
        })
    }
}
