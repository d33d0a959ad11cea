#![allow(clippy::unwrap_used)]

use rblk_core::{CountingPause, PAGE_SIZE, REGION_ALIGNMENT, RblkError, RetryPolicy};
use rblk_io::{
    FabricStore, FabricTransport, MemoryStore, OpStatus, OpTag, PageStore, RingPeer,
    RingTransport, Transport, TransportKind,
};
use rblk_net::{ConnectOptions, Connector, Fabric, LoopbackFabric, ServerOptions};
use rblk_ring::{FaultArea, RingLayout};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

const STORE: usize = 64 * PAGE_SIZE;

fn tag(request_id: u64, sub_index: u32) -> OpTag {
    OpTag {
        request_id,
        generation: 1,
        sub_index,
    }
}

fn ring_pair<S: PageStore>(
    out: RingLayout,
    back: RingLayout,
    store: S,
) -> (RingTransport, RingPeer<S>) {
    let to_peer = FaultArea::create(out).unwrap();
    let from_peer = FaultArea::create(back).unwrap();
    let capacity = store.capacity();
    let transport = RingTransport::new(
        to_peer.producer().unwrap(),
        from_peer.consumer().unwrap(),
        capacity,
    );
    let peer = RingPeer::new(
        to_peer.consumer().unwrap(),
        from_peer.producer().unwrap(),
        store,
    );
    (transport, peer)
}

#[test]
fn test_ring_write_then_read() {
    let layout = RingLayout::new(8, 4 * PAGE_SIZE);
    let (transport, mut peer) = ring_pair(layout, layout, MemoryStore::new(STORE).unwrap());
    assert_eq!(transport.kind(), TransportKind::Ring);
    assert_eq!(transport.queue_depth(), 7);

    let page = vec![0xabu8; PAGE_SIZE];
    transport.issue_write(tag(1, 0), 3 * PAGE_SIZE as u64, &page).unwrap();
    assert_eq!(peer.serve_once(8).unwrap(), 1);

    let ack = transport.poll_completion().unwrap().unwrap();
    assert_eq!(ack.tag, tag(1, 0));
    assert_eq!(ack.status, OpStatus::Success);
    assert!(ack.payload.is_none());

    transport.issue_read(tag(2, 5), 3 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();
    peer.serve_once(8).unwrap();
    let ack = transport.poll_completion().unwrap().unwrap();
    assert_eq!(ack.tag, tag(2, 5));
    assert_eq!(ack.payload.unwrap().as_ref(), page.as_slice());
    assert!(transport.poll_completion().unwrap().is_none());
}

#[test]
fn test_ring_peer_holds_ack_until_engine_drains() {
    let out = RingLayout::new(8, 4 * PAGE_SIZE);
    let back = RingLayout::new(8, PAGE_SIZE + PAGE_SIZE / 2);
    let (transport, mut peer) = ring_pair(out, back, MemoryStore::new(STORE).unwrap());

    transport.issue_read(tag(1, 0), 0, PAGE_SIZE).unwrap();
    transport.issue_read(tag(1, 1), PAGE_SIZE as u64, PAGE_SIZE).unwrap();
    transport.issue_read(tag(1, 2), 0, 16).unwrap();

    // Second ack does not fit in the ack byte ring, so the third request
    // stays queued.
    assert_eq!(peer.serve_once(8).unwrap(), 2);
    assert_eq!(peer.serve_once(8).unwrap(), 0);

    assert_eq!(transport.poll_completion().unwrap().unwrap().tag, tag(1, 0));
    assert!(transport.poll_completion().unwrap().is_none());

    // Draining the first ack lets the held ack out and the third request in.
    assert_eq!(peer.serve_once(8).unwrap(), 1);
    assert_eq!(transport.poll_completion().unwrap().unwrap().tag, tag(1, 1));
    assert_eq!(transport.poll_completion().unwrap().unwrap().tag, tag(1, 2));
}

#[test]
fn test_ring_failed_ack_and_oversized_write() {
    let layout = RingLayout::new(8, 2 * PAGE_SIZE);
    let (transport, mut peer) = ring_pair(layout, layout, MemoryStore::new(STORE).unwrap());

    transport.issue_read(tag(4, 0), STORE as u64, 64).unwrap();
    peer.serve_once(1).unwrap();
    assert_eq!(
        transport.poll_completion().unwrap().unwrap().status,
        OpStatus::Failed
    );

    let err = transport
        .issue_write(tag(5, 0), 0, &vec![0u8; 2 * PAGE_SIZE])
        .unwrap_err();
    assert!(matches!(err, RblkError::OutOfBounds { .. }));
    assert!(!err.is_retryable());
}

#[test]
fn test_ring_full_queue_is_retryable() {
    let layout = RingLayout::new(3, 4 * PAGE_SIZE);
    let (transport, _peer) = ring_pair(layout, layout, MemoryStore::new(STORE).unwrap());

    transport.issue_read(tag(1, 0), 0, 8).unwrap();
    transport.issue_read(tag(1, 1), 0, 8).unwrap();
    let err = transport.issue_write(tag(1, 2), 0, &[1u8; 8]).unwrap_err();
    assert!(err.is_retryable());
    // No payload bytes were committed for the rejected write.
    assert!(matches!(err, RblkError::QueueFull("ring task queue")));
}

#[test]
fn test_ring_peer_thread_serves_concurrently() {
    let layout = RingLayout::new(16, 8 * PAGE_SIZE);
    let (transport, mut peer) = ring_pair(layout, layout, MemoryStore::new(STORE).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let peer_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let pause = CountingPause::new();
        peer.run(&peer_stop, &RetryPolicy::unbounded(Duration::from_micros(10)), &pause)
            .unwrap()
    });

    let mut completed = 0;
    for i in 0..64u32 {
        let position = u64::from(i % 64) * PAGE_SIZE as u64;
        let data = vec![i as u8; PAGE_SIZE];
        loop {
            match transport.issue_write(tag(u64::from(i), 0), position, &data) {
                Ok(()) => break,
                Err(e) if e.is_retryable() => {
                    if transport.poll_completion().unwrap().is_some() {
                        completed += 1;
                    }
                },
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }
    while completed < 64 {
        if transport.poll_completion().unwrap().is_some() {
            completed += 1;
        }
    }

    transport.issue_read(tag(100, 0), 7 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();
    let read = loop {
        if let Some(c) = transport.poll_completion().unwrap() {
            break c;
        }
        thread::yield_now();
    };
    assert!(read.payload.unwrap().iter().all(|&b| b == 7));

    stop.store(true, std::sync::atomic::Ordering::Release);
    assert_eq!(handle.join().unwrap(), 65);
}

fn fabric_connection(fabric: &LoopbackFabric, slot: usize) -> rblk_net::Connection {
    fabric.listen("mem0", ServerOptions::default());
    let connector = Connector::new(
        Arc::new(fabric.clone()),
        ConnectOptions {
            region_size: REGION_ALIGNMENT,
            ..ConnectOptions::default()
        },
    );
    let staging = fabric
        .register_region(FabricTransport::staging_len(16, slot))
        .unwrap();
    connector.connect("mem0", staging).unwrap()
}

#[test]
fn test_fabric_write_then_read() {
    let fabric = LoopbackFabric::new();
    let transport = FabricTransport::new(
        fabric_connection(&fabric, PAGE_SIZE),
        PAGE_SIZE,
        Duration::from_millis(50),
    )
    .unwrap();
    assert_eq!(transport.queue_depth(), 16);
    assert_eq!(transport.capacity(), REGION_ALIGNMENT);

    transport.issue_write(tag(1, 0), 0, &[9u8; PAGE_SIZE]).unwrap();
    let ack = transport.poll_completion().unwrap().unwrap();
    assert_eq!(ack.status, OpStatus::Success);

    transport.issue_read(tag(1, 1), 0, PAGE_SIZE).unwrap();
    let ack = transport.poll_completion().unwrap().unwrap();
    assert_eq!(ack.tag, tag(1, 1));
    assert!(ack.payload.unwrap().iter().all(|&b| b == 9));

    let server = fabric.server_region("mem0").unwrap();
    let mut first = [0u8; 4];
    server.read(0, &mut first).unwrap();
    assert_eq!(first, [9u8; 4]);
}

#[test]
fn test_fabric_slots_bound_in_flight() {
    let fabric = LoopbackFabric::new();
    let transport = FabricTransport::new(
        fabric_connection(&fabric, PAGE_SIZE),
        PAGE_SIZE,
        Duration::from_millis(50),
    )
    .unwrap();

    for i in 0..16 {
        transport.issue_read(tag(1, i), 0, 64).unwrap();
    }
    assert!(transport.issue_read(tag(1, 16), 0, 64).unwrap_err().is_retryable());
    transport.poll_completion().unwrap().unwrap();
    transport.issue_read(tag(1, 16), 0, 64).unwrap();

    assert!(matches!(
        transport.issue_read(tag(2, 0), REGION_ALIGNMENT, 1),
        Err(RblkError::OutOfBounds { .. })
    ));
    assert!(matches!(
        transport.issue_read(tag(2, 0), 0, PAGE_SIZE + 1),
        Err(RblkError::OutOfBounds { .. })
    ));
}

#[test]
fn test_fabric_severed_connection_is_fatal() {
    let fabric = LoopbackFabric::new();
    let transport = FabricTransport::new(
        fabric_connection(&fabric, PAGE_SIZE),
        PAGE_SIZE,
        Duration::from_millis(10),
    )
    .unwrap();
    transport.issue_read(tag(1, 0), 0, 64).unwrap();

    fabric.sever("mem0");
    let err = transport.poll_completion().unwrap_err();
    assert!(err.is_fatal());
    transport.shutdown().unwrap();
    transport.shutdown().unwrap();
}

#[test]
fn test_fabric_rejects_undersized_staging() {
    let fabric = LoopbackFabric::new();
    assert!(matches!(
        FabricTransport::new(
            fabric_connection(&fabric, PAGE_SIZE),
            2 * PAGE_SIZE,
            Duration::from_millis(10),
        ),
        Err(RblkError::Config(_))
    ));
}

#[test]
fn test_ring_peer_bridges_to_fabric() {
    let fabric = LoopbackFabric::new();
    let store = FabricStore::new(fabric_connection(&fabric, PAGE_SIZE));
    let layout = RingLayout::new(8, 4 * PAGE_SIZE);
    let (transport, mut peer) = ring_pair(layout, layout, store);
    assert_eq!(transport.capacity(), REGION_ALIGNMENT);

    transport.issue_write(tag(1, 0), 5 * PAGE_SIZE as u64, &[3u8; PAGE_SIZE]).unwrap();
    peer.serve_once(4).unwrap();
    assert_eq!(
        transport.poll_completion().unwrap().unwrap().status,
        OpStatus::Success
    );

    let server = fabric.server_region("mem0").unwrap();
    let mut page = vec![0u8; PAGE_SIZE];
    server.read(5 * PAGE_SIZE, &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 3));
}

#[test]
fn test_ring_peer_failure_disconnects_after_served_acks() {
    let layout = RingLayout::new(8, 4 * PAGE_SIZE);
    let (transport, mut peer) = ring_pair(layout, layout, MemoryStore::new(STORE).unwrap());
    let failed = Arc::new(AtomicBool::new(false));
    let transport = transport.watch_peer(Arc::clone(&failed));

    transport.issue_read(tag(1, 0), 0, 64).unwrap();
    peer.serve_once(8).unwrap();
    failed.store(true, std::sync::atomic::Ordering::Release);

    let ack = transport.poll_completion().unwrap().unwrap();
    assert_eq!(ack.tag, tag(1, 0));
    assert!(matches!(transport.poll_completion(), Err(RblkError::Disconnected)));
    assert!(matches!(
        transport.issue_read(tag(2, 0), 0, 64),
        Err(RblkError::Disconnected)
    ));
}
