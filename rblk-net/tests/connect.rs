#![allow(clippy::unwrap_used)]

use rblk_core::{PAGE_SIZE, RblkError, REGION_ALIGNMENT};
use rblk_net::{
    ConnectOptions, ConnectionState, Connector, DeviceCaps, Fabric, LoopbackFabric, ServerOptions,
    WcStatus,
};
use std::sync::Arc;
use std::time::Duration;

fn connector(fabric: &LoopbackFabric, region_size: u64) -> Connector {
    Connector::new(
        Arc::new(fabric.clone()),
        ConnectOptions {
            region_size,
            timeout: Duration::from_millis(200),
            ..ConnectOptions::default()
        },
    )
}

fn staging(fabric: &LoopbackFabric) -> Arc<rblk_net::MemoryRegion> {
    fabric.register_region(4 * PAGE_SIZE).unwrap()
}

#[test]
fn test_connect_exchanges_descriptor() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());

    let conn = connector(&fabric, 3 * 1024 * 1024)
        .connect("mem0", staging(&fabric))
        .unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.remote().size, 2 * REGION_ALIGNMENT);
    let server_region = fabric.server_region("mem0").unwrap();
    assert_eq!(conn.remote(), server_region.descriptor());
    assert_eq!(conn.queue_depth(), 16);
}

#[test]
fn test_queue_depth_respects_both_adapters() {
    let fabric = LoopbackFabric::with_caps(DeviceCaps {
        max_qp_rd_atom: 64,
        max_qp_init_rd_atom: 32,
    });
    fabric.listen(
        "mem0",
        ServerOptions {
            caps: DeviceCaps {
                max_qp_rd_atom: 8,
                max_qp_init_rd_atom: 64,
            },
            ..ServerOptions::default()
        },
    );

    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();
    assert_eq!(conn.queue_depth(), 8);
    assert!(conn.queue_pair().depth() >= conn.queue_depth());
}

#[test]
fn test_rejection_then_independent_connect() {
    let fabric = LoopbackFabric::new();
    fabric.listen(
        "busy",
        ServerOptions {
            reject: Some("out of memory".into()),
            ..ServerOptions::default()
        },
    );
    fabric.listen("mem1", ServerOptions::default());
    let connector = connector(&fabric, REGION_ALIGNMENT);

    let err = connector.connect("busy", staging(&fabric)).unwrap_err();
    assert!(matches!(err, RblkError::Rejected(ref reason) if reason == "out of memory"));
    assert!(fabric.server_region("busy").is_none());

    let conn = connector.connect("mem1", staging(&fabric)).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[test]
fn test_resolution_failures_are_terminal() {
    let fabric = LoopbackFabric::new();
    fabric.listen(
        "far",
        ServerOptions {
            unreachable_route: true,
            ..ServerOptions::default()
        },
    );
    fabric.listen(
        "mute",
        ServerOptions {
            silent: true,
            ..ServerOptions::default()
        },
    );
    let connector = connector(&fabric, REGION_ALIGNMENT);

    assert!(matches!(
        connector.connect("nowhere", staging(&fabric)),
        Err(RblkError::AddressResolution(_))
    ));
    assert!(matches!(
        connector.connect("far", staging(&fabric)),
        Err(RblkError::RouteResolution(_))
    ));
    assert!(matches!(
        connector.connect("mute", staging(&fabric)),
        Err(RblkError::Timeout(_))
    ));
}

#[test]
fn test_oversized_region_is_rejected() {
    let fabric = LoopbackFabric::new();
    fabric.listen(
        "small",
        ServerOptions {
            max_region_size: REGION_ALIGNMENT,
            ..ServerOptions::default()
        },
    );
    assert!(matches!(
        connector(&fabric, REGION_ALIGNMENT + 1).connect("small", staging(&fabric)),
        Err(RblkError::Rejected(_))
    ));
}

#[test]
fn test_self_test_and_sync_transfers() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());
    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();

    conn.write_remote(0, &[5u8; 3 * PAGE_SIZE]).unwrap();
    conn.self_test().unwrap();

    let mut page = vec![0u8; PAGE_SIZE];
    conn.read_remote(PAGE_SIZE as u64, &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 5));

    // Larger than the staging region, so it is split into chunks.
    let big: Vec<u8> = (0..6 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    conn.write_remote(8 * PAGE_SIZE as u64, &big).unwrap();
    let mut back = vec![0u8; big.len()];
    conn.read_remote(8 * PAGE_SIZE as u64, &mut back).unwrap();
    assert_eq!(back, big);

    assert!(matches!(
        conn.read_remote(REGION_ALIGNMENT - 1, &mut [0u8; 2]),
        Err(RblkError::OutOfBounds { .. })
    ));
}

#[test]
fn test_bad_access_token_completes_with_error() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());
    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();

    let qp = conn.queue_pair();
    qp.post_read(77, 0, conn.remote().base_address, 64, 0xffff_ffff)
        .unwrap();
    let wc = qp.poll_cq().unwrap().unwrap();
    assert_eq!(wc.wr_id, 77);
    assert_eq!(wc.status, WcStatus::RemoteAccessError);
}

#[test]
fn test_send_queue_is_bounded_by_depth() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());
    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();
    let remote = conn.remote();
    let qp = conn.queue_pair();

    for wr_id in 0..u64::from(conn.queue_depth()) {
        qp.post_read(wr_id, 0, remote.base_address, 8, remote.access_token)
            .unwrap();
    }
    assert!(matches!(
        qp.post_read(99, 0, remote.base_address, 8, remote.access_token),
        Err(RblkError::QueueFull(_))
    ));
    qp.poll_cq().unwrap().unwrap();
    qp.post_read(99, 0, remote.base_address, 8, remote.access_token)
        .unwrap();
}

#[test]
fn test_disconnect_is_idempotent() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());
    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();
    let remote = conn.remote();
    conn.queue_pair()
        .post_write(1, 0, remote.base_address, 16, remote.access_token)
        .unwrap();

    conn.disconnect(Duration::from_millis(50)).unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.queue_pair().outstanding(), 0);
    conn.disconnect(Duration::from_millis(50)).unwrap();

    assert!(matches!(
        conn.queue_pair()
            .post_read(2, 0, remote.base_address, 16, remote.access_token),
        Err(RblkError::Disconnected)
    ));
}

#[test]
fn test_severed_peer_reports_disconnect() {
    let fabric = LoopbackFabric::new();
    fabric.listen("mem0", ServerOptions::default());
    let conn = connector(&fabric, REGION_ALIGNMENT)
        .connect("mem0", staging(&fabric))
        .unwrap();

    assert_eq!(fabric.sever("mem0"), 1);
    assert!(matches!(
        conn.queue_pair().poll_cq(),
        Err(RblkError::Disconnected)
    ));
}
