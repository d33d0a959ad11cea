//! Builds the transport selected by [`EngineConfig::transport`].

use crate::EngineConfig;
use rblk_core::{RblkError, Result, RetryPolicy, ThreadSleep};
use rblk_io::{
    FabricTransport, LocalTransport, MemoryStore, PageStore, RingPeer, RingTransport, Transport,
    TransportKind,
};
use rblk_net::{Connector, Fabric};
use rblk_ring::FaultArea;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// A serving ring peer running on its own thread.
pub struct PeerHandle {
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl PeerHandle {
    /// # Errors
    /// Returns an error if the peer thread cannot be spawned.
    pub fn spawn<S: PageStore + 'static>(mut peer: RingPeer<S>, idle: RetryPolicy) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_failed = Arc::clone(&failed);
        let handle = thread::Builder::new()
            .name("rblk-ring-peer".into())
            .spawn(move || {
                let served = peer.run(&thread_stop, &idle, &ThreadSleep);
                if let Err(e) = &served {
                    error!(target: "rblk::io", error = %e, "Ring peer stopped on error");
                    thread_failed.store(true, Ordering::Release);
                }
                served
            })
            .map_err(RblkError::Io)?;
        Ok(Self {
            stop,
            failed,
            handle: Some(handle),
        })
    }

    /// Set once the peer has stopped on an error. Hand it to
    /// [`RingTransport::watch_peer`] so the engine sees the failure.
    #[must_use]
    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failed)
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop the peer and return how many requests it served.
    ///
    /// # Errors
    /// Returns the error that stopped the peer, if any.
    pub fn stop(&mut self) -> Result<u64> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RblkError::Remote("ring peer thread panicked".into()))?,
            None => Ok(0),
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// A ready transport plus the in-process peer serving it, if any.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub peer: Option<PeerHandle>,
}

/// Build the configured transport.
///
/// The ring transport gets an in-process [`RingPeer`] over a zeroed
/// memory store; the fabric transport connects to `fabric.peer` through
/// `fabric` and runs the connection self-test.
///
/// # Errors
/// Returns `Config` for invalid settings or a missing fabric provider, and
/// any error from area creation, connection setup or the self-test.
pub fn build_transport(
    config: &EngineConfig,
    fabric: Option<Arc<dyn Fabric>>,
) -> Result<TransportHandle> {
    config.validate()?;
    let handle = match config.transport.kind {
        TransportKind::Local => TransportHandle {
            transport: Arc::new(LocalTransport::new(
                store_capacity(config)?,
                config.transport.local_queue_depth,
            )?),
            peer: None,
        },
        TransportKind::Ring => build_ring(config)?,
        TransportKind::Fabric => {
            let fabric = fabric.ok_or_else(|| {
                RblkError::Config("fabric transport requires a fabric provider".into())
            })?;
            build_fabric(config, fabric)?
        },
    };
    info!(
        target: "rblk::engine",
        kind = %handle.transport.kind(),
        queue_depth = handle.transport.queue_depth(),
        capacity = handle.transport.capacity(),
        "Transport ready"
    );
    Ok(handle)
}

fn store_capacity(config: &EngineConfig) -> Result<usize> {
    usize::try_from(config.transport.capacity)
        .map_err(|_| RblkError::Config("transport.capacity exceeds the address space".into()))
}

fn build_ring(config: &EngineConfig) -> Result<TransportHandle> {
    let layout = config.ring_layout();
    let (to_peer, from_peer) = match &config.ring.area_dir {
        Some(dir) => (
            FaultArea::create_file(&dir.join("to_peer.area"), layout)?,
            FaultArea::create_file(&dir.join("from_peer.area"), layout)?,
        ),
        None => (FaultArea::create(layout)?, FaultArea::create(layout)?),
    };
    let store = MemoryStore::new(store_capacity(config)?)?;
    let peer = RingPeer::new(to_peer.consumer()?, from_peer.producer()?, store);
    let idle = RetryPolicy::unbounded(config.completion.policy().backoff);
    let peer = PeerHandle::spawn(peer, idle)?;
    let transport = RingTransport::new(
        to_peer.producer()?,
        from_peer.consumer()?,
        config.transport.capacity,
    )
    .watch_peer(peer.failure_flag());
    Ok(TransportHandle {
        transport: Arc::new(transport),
        peer: Some(peer),
    })
}

fn build_fabric(config: &EngineConfig, fabric: Arc<dyn Fabric>) -> Result<TransportHandle> {
    let options = config.connect_options();
    let slot_size = config.tracker.max_segment_size;
    let staging = fabric.register_region(FabricTransport::staging_len(
        options.max_queue_depth,
        slot_size,
    ))?;
    let connection = Connector::new(fabric, options).connect(&config.fabric.peer, staging)?;
    connection.self_test()?;
    let transport = FabricTransport::new(connection, slot_size, config.drain_timeout())?;
    Ok(TransportHandle {
        transport: Arc::new(transport),
        peer: None,
    })
}
