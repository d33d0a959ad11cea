use rblk_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The remote key or address range was rejected by the peer's adapter.
    RemoteAccessError,
    /// The queue pair entered the error state before the request executed.
    Flushed,
}

/// Completion-queue entry for one posted work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    pub byte_len: usize,
}

impl WorkCompletion {
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Send queue plus completion queue of one connection.
///
/// Reads land in, and writes are sourced from, the local registered region
/// the queue pair was created with. A posted request stays outstanding
/// until its completion has been polled.
pub trait QueuePair: Send + Sync {
    /// # Errors
    /// Returns `QueueFull` when `depth` requests are outstanding, or
    /// `Disconnected` once the queue pair is closed.
    fn post_read(
        &self,
        wr_id: u64,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()>;

    /// # Errors
    /// Same conditions as [`QueuePair::post_read`].
    fn post_write(
        &self,
        wr_id: u64,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()>;

    /// Take one completion if any is ready.
    ///
    /// # Errors
    /// Returns `Disconnected` once the peer has gone away.
    fn poll_cq(&self) -> Result<Option<WorkCompletion>>;

    fn outstanding(&self) -> usize;

    fn depth(&self) -> u32;

    /// Move to the error state; later posts fail.
    fn close(&self);
}
