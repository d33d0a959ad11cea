use bytes::Bytes;
use rblk_core::Result;
use serde::{Deserialize, Serialize};

/// Which [`Transport`] implementation carries sub-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Shared fault queues serviced by a peer process.
    #[default]
    Ring,
    /// One-sided reads and writes over a fabric connection.
    Fabric,
    /// Direct copies into local memory.
    Local,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Ring => write!(f, "ring"),
            TransportKind::Fabric => write!(f, "fabric"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

/// Identifies one issued sub-operation. The generation distinguishes a
/// late completion for a finished request from one for a newer request
/// that reused the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpTag {
    pub request_id: u64,
    pub generation: u64,
    pub sub_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub tag: OpTag,
    pub status: OpStatus,
    /// Data fetched by a successful read.
    pub payload: Option<Bytes>,
}

impl Completion {
    #[must_use]
    pub fn success(tag: OpTag, payload: Option<Bytes>) -> Self {
        Self {
            tag,
            status: OpStatus::Success,
            payload,
        }
    }

    #[must_use]
    pub fn failed(tag: OpTag) -> Self {
        Self {
            tag,
            status: OpStatus::Failed,
            payload: None,
        }
    }
}

/// Carries sub-operations to remote memory and reports their completion.
///
/// Issuing and polling may happen on different threads. Every accepted
/// issue produces exactly one completion unless the transport fails as a
/// whole.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Maximum operations that may be in flight at once.
    fn queue_depth(&self) -> usize;

    /// Size of the remote memory the transport addresses.
    fn capacity(&self) -> u64;

    /// # Errors
    /// `QueueFull` when the transport has no room right now (retryable),
    /// `Disconnected` when it is gone, `OutOfBounds` for invalid ranges.
    fn issue_read(&self, tag: OpTag, position: u64, length: usize) -> Result<()>;

    /// # Errors
    /// Same conditions as [`Transport::issue_read`].
    fn issue_write(&self, tag: OpTag, position: u64, data: &[u8]) -> Result<()>;

    /// Take one completion if any is ready; `None` is the normal idle state.
    ///
    /// # Errors
    /// Returns a fatal error (`Disconnected`, `ProtocolCorruption`) when no
    /// further completions can be trusted.
    fn poll_completion(&self) -> Result<Option<Completion>>;

    /// Release transport resources. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the underlying connection cannot be closed cleanly.
    fn shutdown(&self) -> Result<()>;
}
