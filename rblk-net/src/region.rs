use crate::RemoteMemoryDescriptor;
use rblk_core::{PageBuffer, RblkError, Result};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Registered memory: a pinned, page-aligned buffer addressable by peers
/// through its base address and access key.
pub struct MemoryRegion {
    buffer: Mutex<PageBuffer>,
    base_address: u64,
    key: u32,
    len: usize,
}

impl MemoryRegion {
    /// Allocate and pin `len` zeroed bytes under `key`. Pinning failures
    /// are logged; the region still works, it may just be swapped.
    ///
    /// # Errors
    /// Returns an error if allocation fails.
    pub fn register(len: usize, key: u32) -> Result<Self> {
        let mut buffer = PageBuffer::zeroed(len)?;
        if let Err(e) = buffer.mlock() {
            warn!(target: "rblk::net", len, error = %e, "Registered region is not pinned");
        }
        let base_address = buffer.as_ptr() as u64;
        debug!(target: "rblk::net", key, len, base_address, "Registered memory region");
        Ok(Self {
            buffer: Mutex::new(buffer),
            base_address,
            key,
            len,
        })
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> u32 {
        self.key
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    #[must_use]
    pub fn descriptor(&self) -> RemoteMemoryDescriptor {
        RemoteMemoryDescriptor {
            base_address: self.base_address,
            access_token: self.key,
            size: self.len as u64,
        }
    }

    /// # Errors
    /// Returns `OutOfBounds` if the range leaves the region.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| RblkError::Remote("region lock poisoned".into()))?
            .read_at(offset, dst)
    }

    /// # Errors
    /// Returns `OutOfBounds` if the range leaves the region.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.buffer
            .lock()
            .map_err(|_| RblkError::Remote("region lock poisoned".into()))?
            .write_at(offset, src)
    }

    /// Offset of a peer-supplied remote address inside this region.
    #[must_use]
    pub fn offset_of(&self, address: u64) -> Option<usize> {
        address
            .checked_sub(self.base_address)
            .and_then(|o| usize::try_from(o).ok())
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &self.key)
            .field("len", &self.len)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_matches_region() {
        let region = MemoryRegion::register(8192, 7).unwrap();
        let desc = region.descriptor();
        assert_eq!(desc.access_token, 7);
        assert_eq!(desc.size, 8192);
        assert_eq!(region.offset_of(desc.base_address + 100), Some(100));
        assert_eq!(region.offset_of(desc.base_address.wrapping_sub(1)), None);
    }

    #[test]
    fn test_read_write_bounds() {
        let region = MemoryRegion::register(64, 1).unwrap();
        region.write(60, &[9, 9, 9, 9]).unwrap();
        let mut out = [0u8; 4];
        region.read(60, &mut out).unwrap();
        assert_eq!(out, [9; 4]);
        assert!(region.write(61, &[0; 4]).is_err());
    }
}
