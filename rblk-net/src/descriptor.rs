use rblk_core::{RblkError, Result};

/// Location and access token of a region one peer may access on another.
///
/// Encoded little-endian as handshake private data: base address (8),
/// access token (4), region size (8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteMemoryDescriptor {
    pub base_address: u64,
    pub access_token: u32,
    pub size: u64,
}

impl RemoteMemoryDescriptor {
    pub const SIZE: usize = 20;

    /// What the initiator sends before it knows any remote address: only
    /// the region size it wants the responder to register.
    #[must_use]
    pub fn request(size: u64) -> Self {
        Self {
            base_address: 0,
            access_token: 0,
            size,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.base_address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.access_token.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// # Errors
    /// Returns `ProtocolCorruption` if the private data is too short.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(RblkError::ProtocolCorruption(format!(
                "memory descriptor needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }

        Ok(Self {
            base_address: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            access_token: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            size: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
        })
    }

    /// Remote address of `position`, after checking `position + length`
    /// stays inside the region.
    ///
    /// # Errors
    /// Returns `OutOfBounds` otherwise.
    pub fn address_of(&self, position: u64, length: u64) -> Result<u64> {
        match position.checked_add(length) {
            Some(end) if end <= self.size => Ok(self.base_address + position),
            _ => Err(RblkError::OutOfBounds {
                position,
                length,
                size: self.size,
            }),
        }
    }
}
