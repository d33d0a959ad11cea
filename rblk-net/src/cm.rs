use crate::{MemoryRegion, QueuePair, RemoteMemoryDescriptor};
use rblk_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Adapter limits on outstanding one-sided reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Reads this side can service as a responder.
    pub max_qp_rd_atom: u32,
    /// Reads this side can have outstanding as an initiator.
    pub max_qp_init_rd_atom: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_qp_rd_atom: 16,
            max_qp_init_rd_atom: 16,
        }
    }
}

/// Depth never above what the configuration or either adapter limit allows.
#[must_use]
pub fn negotiate_queue_depth(configured: u32, caps: DeviceCaps) -> u32 {
    let depth = configured
        .min(caps.max_qp_rd_atom)
        .min(caps.max_qp_init_rd_atom);
    if depth == 0 {
        warn!(
            target: "rblk::net",
            configured,
            max_qp_rd_atom = caps.max_qp_rd_atom,
            max_qp_init_rd_atom = caps.max_qp_init_rd_atom,
            "Queue depth negotiated to zero, using a single slot"
        );
        return 1;
    }
    depth
}

/// Parameters of the final handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub private_data: [u8; RemoteMemoryDescriptor::SIZE],
    pub responder_resources: u32,
    pub initiator_depth: u32,
    pub retry_count: u8,
}

/// Connection-manager events, delivered in order on a [`CmChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    /// Handshake finished; carries the responder's descriptor and the
    /// depths it accepted.
    Established {
        private_data: Vec<u8>,
        responder_resources: u32,
        initiator_depth: u32,
    },
    Rejected {
        reason: String,
    },
    AddrError(String),
    RouteError(String),
    Unreachable(String),
    ConnectError(String),
    Disconnected,
}

/// One connection attempt's event channel and identifier.
pub trait CmChannel: Send {
    /// # Errors
    /// Returns an error if the request cannot be started; failures of the
    /// resolution itself arrive as events.
    fn resolve_addr(&mut self, peer: &str, timeout: Duration) -> Result<()>;

    /// # Errors
    /// Returns an error if the request cannot be started.
    fn resolve_route(&mut self, timeout: Duration) -> Result<()>;

    /// Capabilities of the adapter the address resolved to.
    fn device_caps(&self) -> DeviceCaps;

    /// # Errors
    /// Returns an error if the queue pair cannot be created.
    fn create_queue_pair(
        &mut self,
        depth: u32,
        local: Arc<MemoryRegion>,
    ) -> Result<Arc<dyn QueuePair>>;

    /// # Errors
    /// Returns an error if the connect request cannot be sent.
    fn connect(&mut self, params: &ConnectParams) -> Result<()>;

    /// # Errors
    /// Returns `Timeout` if no event arrives within `timeout`.
    fn next_event(&mut self, timeout: Duration) -> Result<CmEvent>;

    /// # Errors
    /// Returns an error if the disconnect request cannot be sent.
    fn disconnect(&mut self) -> Result<()>;
}

/// A network fabric that can register memory and open connection channels.
pub trait Fabric: Send + Sync {
    /// # Errors
    /// Returns an error if the region cannot be allocated.
    fn register_region(&self, len: usize) -> Result<Arc<MemoryRegion>>;

    /// # Errors
    /// Returns an error if the fabric is unavailable.
    fn open_channel(&self) -> Result<Box<dyn CmChannel>>;
}
