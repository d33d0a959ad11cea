use rblk_core::{PageBuffer, RblkError, Result};
use rblk_net::Connection;
use std::sync::Mutex;

/// Backing memory a peer serves page faults from.
pub trait PageStore: Send + Sync {
    fn capacity(&self) -> u64;

    /// # Errors
    /// Returns `OutOfBounds` for ranges outside the store.
    fn read(&self, position: u64, dst: &mut [u8]) -> Result<()>;

    /// # Errors
    /// Returns `OutOfBounds` for ranges outside the store.
    fn write(&self, position: u64, src: &[u8]) -> Result<()>;
}

/// Store held in local page-aligned memory.
#[derive(Debug)]
pub struct MemoryStore {
    buffer: Mutex<PageBuffer>,
}

impl MemoryStore {
    /// # Errors
    /// Returns an error if allocation fails.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            buffer: Mutex::new(PageBuffer::zeroed(capacity)?),
        })
    }

    fn offset(position: u64) -> Result<usize> {
        usize::try_from(position).map_err(|_| RblkError::OutOfBounds {
            position,
            length: 0,
            size: usize::MAX as u64,
        })
    }
}

impl PageStore for MemoryStore {
    fn capacity(&self) -> u64 {
        self.buffer.lock().map(|b| b.len() as u64).unwrap_or(0)
    }

    fn read(&self, position: u64, dst: &mut [u8]) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| RblkError::Remote("memory store lock poisoned".into()))?
            .read_at(Self::offset(position)?, dst)
    }

    fn write(&self, position: u64, src: &[u8]) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| RblkError::Remote("memory store lock poisoned".into()))?
            .write_at(Self::offset(position)?, src)
    }
}

/// Store backed by a remote region over a fabric connection, which turns a
/// ring peer into a bridge from shared queues to remote memory.
#[derive(Debug)]
pub struct FabricStore {
    connection: Connection,
}

impl FabricStore {
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl PageStore for FabricStore {
    fn capacity(&self) -> u64 {
        self.connection.remote().size
    }

    fn read(&self, position: u64, dst: &mut [u8]) -> Result<()> {
        self.connection.read_remote(position, dst)
    }

    fn write(&self, position: u64, src: &[u8]) -> Result<()> {
        self.connection.write_remote(position, src)
    }
}
