//! In-process fabric.
//!
//! Memory servers listen on string addresses inside a [`LoopbackFabric`];
//! queue pairs execute one-sided operations directly against the target
//! region, looked up by access token the way an adapter validates a remote
//! key. Connection-manager events are delivered synchronously, so an empty
//! event queue means no event will ever arrive.

use crate::{
    CmChannel, CmEvent, ConnectParams, DeviceCaps, Fabric, MemoryRegion, QueuePair,
    RemoteMemoryDescriptor, WcOpcode, WcStatus, WorkCompletion,
};
use rblk_core::{REGION_ALIGNMENT, RblkError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Behaviour of a loopback memory server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub caps: DeviceCaps,
    /// Reject every connect request with this reason.
    pub reject: Option<String>,
    /// Fail route resolution.
    pub unreachable_route: bool,
    /// Never answer connect requests.
    pub silent: bool,
    /// Largest region the server agrees to register.
    pub max_region_size: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            caps: DeviceCaps::default(),
            reject: None,
            unreachable_route: false,
            silent: false,
            max_region_size: 16 * 1024 * 1024 * 1024,
        }
    }
}

struct ServerEntry {
    options: ServerOptions,
    links: Vec<Arc<AtomicBool>>,
    last_region: Option<Arc<MemoryRegion>>,
}

struct FabricInner {
    servers: Mutex<HashMap<String, ServerEntry>>,
    regions: Mutex<HashMap<u32, Arc<MemoryRegion>>>,
    next_key: AtomicU32,
    client_caps: DeviceCaps,
}

#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    #[must_use]
    pub fn new() -> Self {
        Self::with_caps(DeviceCaps::default())
    }

    /// Fabric whose initiators advertise `client_caps`.
    #[must_use]
    pub fn with_caps(client_caps: DeviceCaps) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                servers: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
                next_key: AtomicU32::new(0x1000),
                client_caps,
            }),
        }
    }

    /// Start a memory server at `address`, replacing any previous one.
    pub fn listen(&self, address: &str, options: ServerOptions) {
        if let Ok(mut servers) = self.inner.servers.lock() {
            info!(target: "rblk::net", address, "Loopback memory server listening");
            servers.insert(
                address.to_string(),
                ServerEntry {
                    options,
                    links: Vec::new(),
                    last_region: None,
                },
            );
        }
    }

    /// Drop every established connection to `address`, as if the server
    /// went away. Returns the number of connections cut.
    pub fn sever(&self, address: &str) -> usize {
        let Ok(servers) = self.inner.servers.lock() else {
            return 0;
        };
        let Some(entry) = servers.get(address) else {
            return 0;
        };
        let mut cut = 0;
        for link in &entry.links {
            if link.swap(false, Ordering::AcqRel) {
                cut += 1;
            }
        }
        warn!(target: "rblk::net", address, cut, "Loopback server severed");
        cut
    }

    /// The region most recently registered by the server at `address`.
    #[must_use]
    pub fn server_region(&self, address: &str) -> Option<Arc<MemoryRegion>> {
        self.inner
            .servers
            .lock()
            .ok()?
            .get(address)?
            .last_region
            .clone()
    }

    fn register(&self, len: usize) -> Result<Arc<MemoryRegion>> {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(MemoryRegion::register(len, key)?);
        lock(&self.inner.regions)?.insert(key, Arc::clone(&region));
        Ok(region)
    }

    fn region_for(&self, access_token: u32) -> Option<Arc<MemoryRegion>> {
        self.inner.regions.lock().ok()?.get(&access_token).cloned()
    }

    /// Responder side of the handshake.
    fn accept(&self, peer: &str, params: &ConnectParams, link: &Arc<AtomicBool>) -> Option<CmEvent> {
        let Ok(mut servers) = self.inner.servers.lock() else {
            return Some(CmEvent::ConnectError("server table poisoned".into()));
        };
        let Some(entry) = servers.get_mut(peer) else {
            return Some(CmEvent::ConnectError(format!("{peer} stopped listening")));
        };
        if entry.options.silent {
            return None;
        }
        if let Some(reason) = &entry.options.reject {
            return Some(CmEvent::Rejected {
                reason: reason.clone(),
            });
        }

        let requested = match RemoteMemoryDescriptor::parse(&params.private_data) {
            Ok(desc) => desc.size,
            Err(e) => return Some(CmEvent::Rejected { reason: e.to_string() }),
        };
        if requested == 0 || requested > entry.options.max_region_size {
            return Some(CmEvent::Rejected {
                reason: format!("region of {requested} bytes not available"),
            });
        }

        let rounded = requested.next_multiple_of(REGION_ALIGNMENT);
        let region = match usize::try_from(rounded)
            .map_err(|_| RblkError::AllocFailed(usize::MAX))
            .and_then(|len| self.register(len))
        {
            Ok(region) => region,
            Err(e) => return Some(CmEvent::Rejected { reason: e.to_string() }),
        };
        debug!(target: "rblk::net", peer, requested, registered = rounded, key = region.key(), "Server registered region");

        link.store(true, Ordering::Release);
        entry.links.push(Arc::clone(link));
        let private_data = region.descriptor().encode().to_vec();
        entry.last_region = Some(region);

        Some(CmEvent::Established {
            private_data,
            responder_resources: params
                .responder_resources
                .min(entry.options.caps.max_qp_rd_atom),
            initiator_depth: params
                .initiator_depth
                .min(entry.options.caps.max_qp_init_rd_atom),
        })
    }
}

impl Fabric for LoopbackFabric {
    fn register_region(&self, len: usize) -> Result<Arc<MemoryRegion>> {
        self.register(len)
    }

    fn open_channel(&self) -> Result<Box<dyn CmChannel>> {
        Ok(Box::new(LoopbackChannel {
            fabric: self.clone(),
            peer: None,
            events: VecDeque::new(),
            link: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct LoopbackChannel {
    fabric: LoopbackFabric,
    peer: Option<String>,
    events: VecDeque<CmEvent>,
    link: Arc<AtomicBool>,
}

impl LoopbackChannel {
    fn server_options(&self, peer: &str) -> Option<ServerOptions> {
        self.fabric
            .inner
            .servers
            .lock()
            .ok()?
            .get(peer)
            .map(|entry| entry.options.clone())
    }
}

impl CmChannel for LoopbackChannel {
    fn resolve_addr(&mut self, peer: &str, _timeout: Duration) -> Result<()> {
        if self.server_options(peer).is_some() {
            self.peer = Some(peer.to_string());
            self.events.push_back(CmEvent::AddrResolved);
        } else {
            self.events
                .push_back(CmEvent::AddrError(format!("no memory server at {peer}")));
        }
        Ok(())
    }

    fn resolve_route(&mut self, _timeout: Duration) -> Result<()> {
        let peer = self.peer.clone().unwrap_or_default();
        let event = match self.server_options(&peer) {
            Some(options) if !options.unreachable_route => CmEvent::RouteResolved,
            Some(_) => CmEvent::RouteError(format!("no route to {peer}")),
            None => CmEvent::Unreachable(format!("{peer} went away")),
        };
        self.events.push_back(event);
        Ok(())
    }

    fn device_caps(&self) -> DeviceCaps {
        self.fabric.inner.client_caps
    }

    fn create_queue_pair(
        &mut self,
        depth: u32,
        local: Arc<MemoryRegion>,
    ) -> Result<Arc<dyn QueuePair>> {
        Ok(Arc::new(LoopbackQueuePair {
            fabric: self.fabric.clone(),
            depth,
            local,
            link: Arc::clone(&self.link),
            cq: Mutex::new(VecDeque::with_capacity(depth as usize)),
            closed: AtomicBool::new(false),
        }))
    }

    fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        let peer = self.peer.clone().unwrap_or_default();
        if let Some(event) = self.fabric.accept(&peer, params, &self.link) {
            self.events.push_back(event);
        }
        Ok(())
    }

    fn next_event(&mut self, _timeout: Duration) -> Result<CmEvent> {
        self.events
            .pop_front()
            .ok_or(RblkError::Timeout("connection event"))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.link.store(false, Ordering::Release);
        Ok(())
    }
}

struct LoopbackQueuePair {
    fabric: LoopbackFabric,
    depth: u32,
    local: Arc<MemoryRegion>,
    link: Arc<AtomicBool>,
    cq: Mutex<VecDeque<WorkCompletion>>,
    closed: AtomicBool,
}

impl LoopbackQueuePair {
    fn post(
        &self,
        opcode: WcOpcode,
        wr_id: u64,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || !self.link.load(Ordering::Acquire) {
            return Err(RblkError::Disconnected);
        }
        let mut cq = lock(&self.cq)?;
        if cq.len() >= self.depth as usize {
            return Err(RblkError::QueueFull("send queue"));
        }

        let status = match self.execute(opcode, local_offset, remote_address, len, access_token) {
            Ok(()) => WcStatus::Success,
            Err(e) => {
                debug!(target: "rblk::net", wr_id, ?opcode, error = %e, "One-sided operation failed");
                WcStatus::RemoteAccessError
            },
        };
        cq.push_back(WorkCompletion {
            wr_id,
            opcode,
            status,
            byte_len: len,
        });
        Ok(())
    }

    fn execute(
        &self,
        opcode: WcOpcode,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()> {
        let region = self
            .fabric
            .region_for(access_token)
            .ok_or_else(|| RblkError::Remote(format!("unknown access token {access_token:#x}")))?;
        let offset = region.offset_of(remote_address).ok_or(RblkError::OutOfBounds {
            position: remote_address,
            length: len as u64,
            size: region.len() as u64,
        })?;

        let mut staging = vec![0u8; len];
        match opcode {
            WcOpcode::Read => {
                region.read(offset, &mut staging)?;
                self.local.write(local_offset, &staging)
            },
            WcOpcode::Write => {
                self.local.read(local_offset, &mut staging)?;
                region.write(offset, &staging)
            },
        }
    }
}

impl QueuePair for LoopbackQueuePair {
    fn post_read(
        &self,
        wr_id: u64,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()> {
        self.post(WcOpcode::Read, wr_id, local_offset, remote_address, len, access_token)
    }

    fn post_write(
        &self,
        wr_id: u64,
        local_offset: usize,
        remote_address: u64,
        len: usize,
        access_token: u32,
    ) -> Result<()> {
        self.post(WcOpcode::Write, wr_id, local_offset, remote_address, len, access_token)
    }

    fn poll_cq(&self) -> Result<Option<WorkCompletion>> {
        if !self.closed.load(Ordering::Acquire) && !self.link.load(Ordering::Acquire) {
            return Err(RblkError::Disconnected);
        }
        Ok(lock(&self.cq)?.pop_front())
    }

    fn outstanding(&self) -> usize {
        self.cq.lock().map(|cq| cq.len()).unwrap_or(0)
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RblkError::Remote("loopback fabric lock poisoned".into()))
}
