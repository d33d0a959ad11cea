use crate::{
    CmChannel, CmEvent, ConnectParams, Fabric, MemoryRegion, QueuePair, RemoteMemoryDescriptor,
    WorkCompletion, negotiate_queue_depth,
};
use rblk_core::{MAX_FABRIC_QUEUE_DEPTH, PAGE_SIZE, RblkError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Upper bound on the negotiated queue depth.
    pub max_queue_depth: u32,
    /// Size of the region the responder is asked to register.
    pub region_size: u64,
    /// Wait for each connection-manager event, and for synchronous operations.
    pub timeout: Duration,
    pub retry_count: u8,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_queue_depth: MAX_FABRIC_QUEUE_DEPTH,
            region_size: 40 * 1024 * 1024,
            timeout: Duration::from_secs(10),
            retry_count: 7,
        }
    }
}

/// Phases of the initiator handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AddressResolving,
    RouteResolving,
    Connecting,
}

pub struct Connector {
    fabric: Arc<dyn Fabric>,
    options: ConnectOptions,
}

impl Connector {
    #[must_use]
    pub fn new(fabric: Arc<dyn Fabric>, options: ConnectOptions) -> Self {
        Self { fabric, options }
    }

    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Establish a connection to `peer`, staging one-sided transfers
    /// through `local`.
    ///
    /// Address, route and rejection failures are terminal for this attempt
    /// and are returned as-is; nothing is retried here.
    ///
    /// # Errors
    /// Returns the connection-level error that ended the handshake, or
    /// `Timeout` if an event did not arrive in time.
    pub fn connect(&self, peer: &str, local: Arc<MemoryRegion>) -> Result<Connection> {
        let mut channel = self.fabric.open_channel()?;
        let mut queue_pair: Option<Arc<dyn QueuePair>> = None;

        let result = self.handshake(peer, channel.as_mut(), &local, &mut queue_pair);
        match result {
            Ok((remote, queue_depth)) => {
                let Some(queue_pair) = queue_pair else {
                    return Err(RblkError::ProtocolCorruption(
                        "connection established without a queue pair".into(),
                    ));
                };
                info!(
                    target: "rblk::net",
                    peer,
                    queue_depth,
                    remote_size = remote.size,
                    "Connection established"
                );
                Ok(Connection {
                    peer: peer.to_string(),
                    remote,
                    local,
                    queue_pair,
                    queue_depth,
                    channel: Mutex::new(channel),
                    state: Mutex::new(ConnectionState::Connected),
                    next_wr_id: AtomicU64::new(1),
                    op_timeout: self.options.timeout,
                })
            }
            Err(e) => {
                warn!(target: "rblk::net", peer, error = %e, "Connection attempt failed");
                if let Some(queue_pair) = queue_pair {
                    queue_pair.close();
                }
                let _ = channel.disconnect();
                Err(e)
            }
        }
    }

    fn handshake(
        &self,
        peer: &str,
        channel: &mut dyn CmChannel,
        local: &Arc<MemoryRegion>,
        queue_pair: &mut Option<Arc<dyn QueuePair>>,
    ) -> Result<(RemoteMemoryDescriptor, u32)> {
        let timeout = self.options.timeout;
        let mut depth = 0;
        let mut phase = Handshake::AddressResolving;
        debug!(target: "rblk::net", peer, from = ?ConnectionState::Idle, to = ?ConnectionState::Resolving, "Connection state");
        channel.resolve_addr(peer, timeout)?;

        loop {
            let event = channel.next_event(timeout)?;
            debug!(target: "rblk::net", peer, ?phase, ?event, "Connection event");

            match (phase, event) {
                (Handshake::AddressResolving, CmEvent::AddrResolved) => {
                    depth = negotiate_queue_depth(self.options.max_queue_depth, channel.device_caps());
                    *queue_pair = Some(channel.create_queue_pair(depth, Arc::clone(local))?);
                    channel.resolve_route(timeout)?;
                    phase = Handshake::RouteResolving;
                },
                (Handshake::RouteResolving, CmEvent::RouteResolved) => {
                    let params = ConnectParams {
                        private_data: RemoteMemoryDescriptor::request(self.options.region_size)
                            .encode(),
                        responder_resources: depth,
                        initiator_depth: depth,
                        retry_count: self.options.retry_count,
                    };
                    channel.connect(&params)?;
                    phase = Handshake::Connecting;
                },
                (
                    Handshake::Connecting,
                    CmEvent::Established {
                        private_data,
                        responder_resources,
                        initiator_depth,
                    },
                ) => {
                    let remote = RemoteMemoryDescriptor::parse(&private_data)?;
                    let accepted = depth.min(responder_resources).min(initiator_depth).max(1);
                    return Ok((remote, accepted));
                },
                (_, CmEvent::Rejected { reason }) => return Err(RblkError::Rejected(reason)),
                (_, CmEvent::AddrError(reason)) => {
                    return Err(RblkError::AddressResolution(reason));
                },
                (_, CmEvent::RouteError(reason)) => {
                    return Err(RblkError::RouteResolution(reason));
                },
                (_, CmEvent::Unreachable(reason) | CmEvent::ConnectError(reason)) => {
                    return Err(RblkError::Unreachable(reason));
                },
                (_, CmEvent::Disconnected) => return Err(RblkError::Disconnected),
                (phase, event) => {
                    return Err(RblkError::ProtocolCorruption(format!(
                        "unexpected {event:?} during {phase:?}"
                    )));
                },
            }
        }
    }
}

/// A live connection: the peer's region descriptor plus a queue pair that
/// stages transfers through the local registered region.
pub struct Connection {
    peer: String,
    remote: RemoteMemoryDescriptor,
    local: Arc<MemoryRegion>,
    queue_pair: Arc<dyn QueuePair>,
    queue_depth: u32,
    channel: Mutex<Box<dyn CmChannel>>,
    state: Mutex<ConnectionState>,
    next_wr_id: AtomicU64,
    op_timeout: Duration,
}

impl Connection {
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn remote(&self) -> RemoteMemoryDescriptor {
        self.remote
    }

    #[must_use]
    pub fn local_region(&self) -> &Arc<MemoryRegion> {
        &self.local
    }

    #[must_use]
    pub fn queue_pair(&self) -> &Arc<dyn QueuePair> {
        &self.queue_pair
    }

    #[must_use]
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    #[inline]
    pub fn next_wr_id(&self) -> u64 {
        self.next_wr_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Synchronously read `dst.len()` bytes at `position` of the remote
    /// region, staging through the start of the local region.
    ///
    /// Must not be mixed with asynchronous users of the same queue pair.
    ///
    /// # Errors
    /// Returns `OutOfBounds`, `Remote` for a failed completion, or `Timeout`.
    pub fn read_remote(&self, position: u64, dst: &mut [u8]) -> Result<()> {
        let chunk = self.local.len().max(1);
        let mut done = 0;
        while done < dst.len() {
            let len = chunk.min(dst.len() - done);
            let address = self.remote.address_of(position + done as u64, len as u64)?;
            let wr_id = self.next_wr_id();
            self.queue_pair
                .post_read(wr_id, 0, address, len, self.remote.access_token)?;
            self.expect_success(self.wait_for(wr_id)?)?;
            self.local.read(0, &mut dst[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Synchronous counterpart of [`Connection::read_remote`] for writes.
    ///
    /// # Errors
    /// Returns `OutOfBounds`, `Remote` for a failed completion, or `Timeout`.
    pub fn write_remote(&self, position: u64, src: &[u8]) -> Result<()> {
        let chunk = self.local.len().max(1);
        let mut done = 0;
        while done < src.len() {
            let len = chunk.min(src.len() - done);
            let address = self.remote.address_of(position + done as u64, len as u64)?;
            self.local.write(0, &src[done..done + len])?;
            let wr_id = self.next_wr_id();
            self.queue_pair
                .post_write(wr_id, 0, address, len, self.remote.access_token)?;
            self.expect_success(self.wait_for(wr_id)?)?;
            done += len;
        }
        Ok(())
    }

    fn wait_for(&self, wr_id: u64) -> Result<WorkCompletion> {
        let deadline = Instant::now() + self.op_timeout;
        loop {
            match self.queue_pair.poll_cq()? {
                Some(wc) if wc.wr_id == wr_id => return Ok(wc),
                Some(wc) => {
                    warn!(target: "rblk::net", wr_id = wc.wr_id, expected = wr_id, "Discarding unrelated completion");
                },
                None if Instant::now() >= deadline => return Err(RblkError::Timeout("work completion")),
                None => std::thread::sleep(Duration::from_micros(10)),
            }
        }
    }

    fn expect_success(&self, wc: WorkCompletion) -> Result<()> {
        if wc.is_success() {
            Ok(())
        } else {
            Err(RblkError::Remote(format!(
                "{:?} to {} completed with {:?}",
                wc.opcode, self.peer, wc.status
            )))
        }
    }

    /// Post-connect health probe: read a page, overwrite it with a marker,
    /// read the marker back, then restore the original contents.
    ///
    /// # Errors
    /// Returns `Remote` if the marker does not read back, or any transfer error.
    pub fn self_test(&self) -> Result<()> {
        let position = if self.remote.size >= 2 * PAGE_SIZE as u64 {
            PAGE_SIZE as u64
        } else {
            0
        };
        let len = PAGE_SIZE.min(usize::try_from(self.remote.size).unwrap_or(PAGE_SIZE));

        let mut original = vec![0u8; len];
        self.read_remote(position, &mut original)?;

        let marker = vec![0x42u8; len];
        self.write_remote(position, &marker)?;
        let mut readback = vec![0u8; len];
        self.read_remote(position, &mut readback)?;
        self.write_remote(position, &original)?;

        if readback != marker {
            return Err(RblkError::Remote(format!(
                "self-test marker did not read back from {}",
                self.peer
            )));
        }
        info!(target: "rblk::net", peer = %self.peer, position, "Connection self-test passed");
        Ok(())
    }

    /// Close the connection. Outstanding completions are drained for at
    /// most `drain_timeout`; calling this again is a no-op.
    ///
    /// # Errors
    /// Returns an error if the disconnect request cannot be sent.
    pub fn disconnect(&self, drain_timeout: Duration) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RblkError::Remote("connection state lock poisoned".into()))?;
            if *state == ConnectionState::Closed {
                debug!(target: "rblk::net", peer = %self.peer, "Already disconnected");
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }

        let deadline = Instant::now() + drain_timeout;
        let mut drained = 0usize;
        while self.queue_pair.outstanding() > 0 && Instant::now() < deadline {
            match self.queue_pair.poll_cq() {
                Ok(Some(_)) => drained += 1,
                Ok(None) => std::thread::sleep(Duration::from_micros(100)),
                Err(_) => break,
            }
        }
        let abandoned = self.queue_pair.outstanding();
        if abandoned > 0 {
            warn!(target: "rblk::net", peer = %self.peer, abandoned, "Disconnecting with operations still outstanding");
        }

        self.queue_pair.close();
        let result = self
            .channel
            .lock()
            .map_err(|_| RblkError::Remote("channel lock poisoned".into()))?
            .disconnect();
        info!(target: "rblk::net", peer = %self.peer, drained, "Disconnected");
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("queue_depth", &self.queue_depth)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
