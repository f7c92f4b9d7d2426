//! Transfer integration tests
//!
//! PUT/GET through pinned temporary buffers between in-process nodes.

use nodeflow::network::{
    ClusterConfig, LocalCluster, NodeId, Transfer, TransferError, TransportLimits,
};
use nodeflow::runtime::memory::PinnedError;
use nodeflow::runtime::scheduler::{SchedulerConfig, SingleSyncCond};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn start(segment_len: usize) -> LocalCluster {
    let cluster = ClusterConfig {
        nodes: 2,
        segment_len,
        limits: TransportLimits {
            max_medium: 1024,
            max_long_request: 4096,
            max_long_reply: 4096,
        },
        ..ClusterConfig::default()
    };
    let scheduler = SchedulerConfig {
        num_workers: 1,
        default_stack_size: 256 * 1024,
        ..SchedulerConfig::default()
    };
    LocalCluster::start(&cluster, &scheduler).unwrap()
}

#[test]
fn test_strided_put() {
    let cluster = start(64 * 1024);
    let master = cluster.master();
    let node = NodeId(1);

    let source: Vec<u8> = (1..=64).collect();
    let local = master.memory().allocate(64);
    master.memory().write(local, &source).unwrap();
    let dest = master.malloc(node, 64).unwrap();

    let done = Arc::new(SingleSyncCond::new());
    let d = done.clone();
    master
        .put_strided_1d(
            Transfer::new(node, dest, local, 8),
            4,
            16,
            Some(Box::new(move || d.set())),
        )
        .unwrap();
    master.wait(&*done);

    let got = cluster.network(node).memory().read(dest, 64).unwrap();
    for i in 0..4 {
        let row = i * 16;
        assert_eq!(&got[row..row + 8], &source[row..row + 8]);
        assert_eq!(&got[row + 8..row + 16], &[0u8; 8]);
    }
    cluster.shutdown().unwrap();
}

#[test]
fn test_puts_wait_for_pinned_space() {
    // 16 KiB of temporary buffers on the destination
    let cluster = start(32 * 1024);
    let master = cluster.master();
    let node = NodeId(1);
    let len = 12 * 1024;

    let completed = Arc::new(AtomicUsize::new(0));
    let mut dests = Vec::new();
    for round in 0..4u8 {
        let local = master.memory().allocate(len);
        master.memory().write(local, &vec![round + 1; len]).unwrap();
        let dest = master.malloc(node, len).unwrap();
        let c = completed.clone();
        // each put needs the previous buffer back first
        master
            .put(
                Transfer::new(node, dest, local, len as u64),
                Some(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        dests.push(dest);
    }

    let all = Arc::new(SingleSyncCond::new());
    let a = all.clone();
    let c = completed.clone();
    let tail = master.memory().allocate(8);
    let tail_dest = master.malloc(node, 8).unwrap();
    master
        .put(
            Transfer::new(node, tail_dest, tail, 8),
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                a.set();
            })),
        )
        .unwrap();
    master.wait(&*all);
    // buffers come back in order, so the tail's functor ran last
    assert_eq!(completed.load(Ordering::SeqCst), 5);

    let remote = cluster.network(node);
    for (round, dest) in dests.iter().enumerate() {
        let data = remote.memory().read(*dest, len).unwrap();
        assert!(data.iter().all(|&b| b == round as u8 + 1));
    }
    assert_eq!(master.pending_functors(), 0);
    cluster.shutdown().unwrap();
}

#[test]
fn test_oversized_put_is_rejected() {
    let cluster = start(32 * 1024);
    let master = cluster.master();
    let local = master.memory().allocate(20 * 1024);

    let result = master.put(Transfer::new(NodeId(1), 0x1000, local, 20 * 1024), None);
    assert!(matches!(
        result,
        Err(TransferError::Pinned(PinnedError::TooLarge { size: 20480, capacity: 16384 }))
    ));
    assert_eq!(master.pending_functors(), 0);
    cluster.shutdown().unwrap();
}

#[test]
fn test_byte_counters() {
    let cluster = start(64 * 1024);
    let master = cluster.master();
    let node = NodeId(1);
    let local = master.memory().allocate(5000);
    let dest = master.malloc(node, 5000).unwrap();
    let tx_before = master.stats().tx();

    let done = Arc::new(SingleSyncCond::new());
    let d = done.clone();
    master
        .put(
            Transfer::new(node, dest, local, 5000),
            Some(Box::new(move || d.set())),
        )
        .unwrap();
    master.wait(&*done);
    let fetched = master.get(Transfer::new(node, dest, local, 5000)).unwrap();
    master.wait(&*fetched);

    // the PUT data plus a small GET request
    let sent = master.stats().tx() - tx_before;
    assert!((5000..5200).contains(&sent), "sent {}", sent);
    assert!(master.stats().rx() >= 5000);
    assert_eq!(
        master.stats().total(),
        master.stats().tx() + master.stats().rx()
    );
    cluster.shutdown().unwrap();
}
