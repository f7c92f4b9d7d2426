//! Network 单元测试
//!
//! 在进程内集群上测试数据传输、中继、远程内存管理与终止流程

use crate::network::{
    ClusterConfig, LocalCluster, Network, NetworkStats, NodeId, Transfer, TransferError,
    TransportLimits,
};
use crate::runtime::scheduler::{SchedulerConfig, SingleSyncCond, WdId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn start(nodes: usize) -> LocalCluster {
    start_with_limits(nodes, TransportLimits::default())
}

fn start_with_limits(
    nodes: usize,
    limits: TransportLimits,
) -> LocalCluster {
    let cluster = ClusterConfig {
        nodes,
        limits,
        segment_len: 64 * 1024,
        ..ClusterConfig::default()
    };
    let scheduler = SchedulerConfig {
        num_workers: 1,
        default_stack_size: 256 * 1024,
        ..SchedulerConfig::default()
    };
    LocalCluster::start(&cluster, &scheduler).unwrap()
}

/// PUT and wait until the master ran the completion functor.
fn put_and_wait(
    master: &Arc<Network>,
    transfer: Transfer,
) {
    let done = Arc::new(SingleSyncCond::new());
    let d = done.clone();
    master.put(transfer, Some(Box::new(move || d.set()))).unwrap();
    master.wait(&*done);
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

#[cfg(test)]
mod stats_tests {
    use super::*;

    #[test]
    fn test_totals() {
        let stats = NetworkStats::default();
        stats.record_sent(10);
        stats.record_received(5);
        stats.record_received(0);
        assert_eq!(stats.tx(), 10);
        assert_eq!(stats.rx(), 5);
        assert_eq!(stats.total(), 15);
        assert_eq!(stats.messages_received.load(Ordering::Relaxed), 2);
    }
}

#[cfg(test)]
mod put_tests {
    use super::*;

    #[test]
    fn test_put_lands_at_final_address() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let data = pattern(1000);
        let src = master.memory().allocate(data.len());
        master.memory().write(src, &data).unwrap();
        let dest = master.malloc(node, data.len()).unwrap();

        put_and_wait(master, Transfer::new(node, dest, src, data.len() as u64));

        let remote = cluster.network(node);
        assert_eq!(remote.memory().read(dest, data.len()).unwrap(), data);
        assert_eq!(master.pending_functors(), 0);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_put_is_chunked_to_the_request_limit() {
        let limits = TransportLimits {
            max_long_request: 64,
            ..TransportLimits::default()
        };
        let cluster = start_with_limits(2, limits);
        let master = cluster.master();
        let node = NodeId(1);
        let data = pattern(1000);
        let src = master.memory().allocate(data.len());
        master.memory().write(src, &data).unwrap();
        let dest = master.malloc(node, data.len()).unwrap();

        let sent_before = master.stats().messages_sent.load(Ordering::Relaxed);
        put_and_wait(master, Transfer::new(node, dest, src, data.len() as u64));
        let sent = master.stats().messages_sent.load(Ordering::Relaxed) - sent_before;

        assert_eq!(sent, 16);
        assert_eq!(cluster.network(node).memory().read(dest, 1000).unwrap(), data);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_functor_runs_after_buffer_is_free() {
        let cluster = start(2);
        let master = cluster.master().clone();
        let node = NodeId(1);
        let src = master.memory().allocate(256);
        let dest = master.malloc(node, 256).unwrap();

        let done = Arc::new(SingleSyncCond::new());
        let freed = Arc::new(AtomicBool::new(false));
        let (d, f, net) = (done.clone(), freed.clone(), master.clone());
        master
            .put(
                Transfer::new(node, dest, src, 256),
                Some(Box::new(move || {
                    let in_use = net
                        .pinned()
                        .with_remote(1, |alloc| alloc.allocated_bytes())
                        .unwrap();
                    f.store(in_use == 0, Ordering::SeqCst);
                    d.set();
                })),
            )
            .unwrap();
        master.wait(&*done);

        assert!(freed.load(Ordering::SeqCst));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_sequence_numbers_advance_by_one() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let src = master.memory().allocate(64);
        let dest = master.malloc(node, 64).unwrap();

        let first = master.next_sequence(node);
        for i in 1..=3 {
            put_and_wait(master, Transfer::new(node, dest, src, 64));
            assert_eq!(master.next_sequence(node), first + i);
        }
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_put_records_destination_version() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let src = master.memory().allocate(64);
        let dest = master.malloc(node, 64).unwrap();
        let transfer = Transfer::new(node, dest, src, 64);
        let region = transfer.region();
        master.directory().record_write(region, NodeId::MASTER);

        put_and_wait(master, transfer);

        let remote = cluster.network(node);
        let info = remote.directory().get_version_info(region);
        assert_eq!(info.version, 1);
        assert!(info.holders().any(|holder| holder == node));
        assert!(master.directory().holders(region).contains(&node));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_holder_recorded_when_put_completes() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node).clone();
        let src = master.memory().allocate(256);
        let dest = master.malloc(node, 256).unwrap();
        let transfer = Transfer::new(node, dest, src, 256);
        let region = transfer.region();

        // from here on node 1 only handles messages when polled below
        cluster.nodes()[1].scheduler.shutdown();
        let done = Arc::new(SingleSyncCond::new());
        let d = done.clone();
        master.put(transfer, Some(Box::new(move || d.set()))).unwrap();
        assert!(!master.directory().holders(region).contains(&node));

        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    remote.poll();
                    std::thread::yield_now();
                }
            })
        };
        master.wait(&*done);
        assert!(master.directory().holders(region).contains(&node));

        cluster.shutdown().unwrap();
        stop.store(true, Ordering::SeqCst);
        poller.join().unwrap();
    }

    #[test]
    fn test_rejected_puts() {
        let cluster = start(2);
        let master = cluster.master();
        let empty = master.put(Transfer::new(NodeId(1), 0, 0, 0), None);
        assert!(matches!(empty, Err(TransferError::Empty)));

        let unknown = master.put(Transfer::new(NodeId(5), 0, 0, 8), None);
        assert!(matches!(unknown, Err(TransferError::UnknownNode(NodeId(5)))));

        let worker = cluster.network(NodeId(1));
        let not_master = worker.put(Transfer::new(NodeId::MASTER, 0, 0, 8), None);
        assert!(matches!(not_master, Err(TransferError::NotMaster)));
        cluster.shutdown().unwrap();
    }
}

#[cfg(test)]
mod get_tests {
    use super::*;

    #[test]
    fn test_get_contiguous() {
        let limits = TransportLimits {
            max_long_reply: 100,
            ..TransportLimits::default()
        };
        let cluster = start_with_limits(2, limits);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let data = pattern(700);
        let addr = remote.memory().allocate(data.len());
        remote.memory().write(addr, &data).unwrap();

        let local = master.memory().allocate(data.len());
        let done = master
            .get(Transfer::new(node, addr, local, data.len() as u64))
            .unwrap();
        master.wait(&*done);

        assert_eq!(master.memory().read(local, data.len()).unwrap(), data);
        assert_eq!(master.pending_gets(), 0);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_get_strided_leaves_gaps_untouched() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let source = pattern(64);
        let addr = remote.memory().allocate(64);
        remote.memory().write(addr, &source).unwrap();

        let local = master.memory().allocate(64);
        let done = master
            .get_strided_1d(Transfer::new(node, addr, local, 8), 4, 16)
            .unwrap();
        master.wait(&*done);

        let got = master.memory().read(local, 64).unwrap();
        for (i, byte) in got.iter().enumerate() {
            if i % 16 < 8 {
                assert_eq!(*byte, source[i], "row byte {}", i);
            } else {
                assert_eq!(*byte, 0, "gap byte {}", i);
            }
        }
        // the pack buffer went back
        assert_eq!(master.pinned().with_pack(|alloc| alloc.allocated_bytes()), 0);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_get_request_larger_than_a_medium_message() {
        // the request body alone is one copy and one dimension, 72 bytes
        let limits = TransportLimits {
            max_medium: 16,
            ..TransportLimits::default()
        };
        let cluster = start_with_limits(2, limits);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let source = pattern(64);
        let addr = remote.memory().allocate(64);
        remote.memory().write(addr, &source).unwrap();

        let local = master.memory().allocate(64);
        let done = master
            .get_strided_1d(Transfer::new(node, addr, local, 8), 4, 16)
            .unwrap();
        master.wait(&*done);

        let got = master.memory().read(local, 64).unwrap();
        for row in 0..4 {
            let at = row * 16;
            assert_eq!(&got[at..at + 8], &source[at..at + 8]);
        }
        assert_eq!(remote.fragments.pending(), 0);
        cluster.shutdown().unwrap();
    }
}

#[cfg(test)]
mod relay_tests {
    use super::*;

    #[test]
    fn test_request_put_moves_data_between_workers() {
        let cluster = start(3);
        let master = cluster.master();
        let (source, dest) = (NodeId(1), NodeId(2));
        let data = pattern(300);
        let from = master.malloc(source, data.len()).unwrap();
        cluster.network(source).memory().write(from, &data).unwrap();
        let to = master.malloc(dest, data.len()).unwrap();

        let done = Arc::new(SingleSyncCond::new());
        let d = done.clone();
        master
            .request_put(
                source,
                Transfer::new(dest, to, from, data.len() as u64).owner(WdId(0)),
                Some(Box::new(move || d.set())),
            )
            .unwrap();
        master.wait(&*done);

        assert_eq!(cluster.network(dest).memory().read(to, data.len()).unwrap(), data);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_get_waits_for_announced_relay() {
        let cluster = start(3);
        let master = cluster.master();
        let (source, dest) = (NodeId(1), NodeId(2));
        let data = pattern(128);
        let from = master.malloc(source, data.len()).unwrap();
        cluster.network(source).memory().write(from, &data).unwrap();
        let to = master.malloc(dest, data.len()).unwrap();

        master
            .request_put(source, Transfer::new(dest, to, from, 128), None)
            .unwrap();
        // ordered after the relay announcement, so it must see the relayed bytes
        let local = master.memory().allocate(128);
        let done = master.get(Transfer::new(dest, to, local, 128)).unwrap();
        master.wait(&*done);

        assert_eq!(master.memory().read(local, 128).unwrap(), data);
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_strided_relay() {
        let cluster = start(3);
        let master = cluster.master();
        let (source, dest) = (NodeId(1), NodeId(2));
        let data = pattern(64);
        let from = master.malloc(source, 64).unwrap();
        cluster.network(source).memory().write(from, &data).unwrap();
        let to = master.malloc(dest, 64).unwrap();

        let done = Arc::new(SingleSyncCond::new());
        let d = done.clone();
        master
            .request_put_strided_1d(
                source,
                Transfer::new(dest, to, from, 8),
                4,
                16,
                Some(Box::new(move || d.set())),
            )
            .unwrap();
        master.wait(&*done);

        let got = cluster.network(dest).memory().read(to, 64).unwrap();
        for row in 0..4 {
            let at = row * 16;
            assert_eq!(&got[at..at + 8], &data[at..at + 8]);
            assert!(got[at + 8..at + 16].iter().all(|&b| b == 0));
        }
        cluster.shutdown().unwrap();
    }
}

#[cfg(test)]
mod heap_tests {
    use super::*;

    #[test]
    fn test_malloc_free() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let addr = master.malloc(node, 4096).unwrap();
        let remote = cluster.network(node);
        assert!(remote.memory().is_mapped(addr, 4096));

        master.free(node, addr).unwrap();
        // a second malloc round trip orders after the free
        let other = master.malloc(node, 16).unwrap();
        assert_ne!(other, addr);
        assert!(!remote.memory().is_mapped(addr, 1));
        assert!(matches!(master.malloc(node, 0), Err(TransferError::Empty)));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_realloc_keeps_prefix() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let old = master.malloc(node, 32).unwrap();
        remote.memory().write(old, &pattern(32)).unwrap();

        let new = master.realloc(node, old, 32, 64).unwrap();
        master.malloc(node, 8).unwrap();

        let moved = remote.memory().read(new, 64).unwrap();
        assert_eq!(&moved[..32], &pattern(32)[..]);
        assert!(moved[32..].iter().all(|&b| b == 0));
        assert!(!remote.memory().is_mapped(old, 1));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_put_fill_words() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let addr = master.malloc(node, 16).unwrap();

        master.put_fill(node, addr, 16, 4, 0xAABB_CCDD).unwrap();
        master.malloc(node, 8).unwrap();
        assert_eq!(
            remote.memory().read(addr, 8).unwrap(),
            vec![0xDD, 0xCC, 0xBB, 0xAA, 0xDD, 0xCC, 0xBB, 0xAA]
        );

        master.put_fill(node, addr, 16, 1, 0x7F).unwrap();
        master.malloc(node, 8).unwrap();
        assert!(remote.memory().read(addr, 16).unwrap().iter().all(|&b| b == 0x7F));

        assert!(matches!(
            master.put_fill(node, addr, 16, 3, 0),
            Err(TransferError::Memory(_))
        ));
        cluster.shutdown().unwrap();
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_master_hostname_is_announced() {
        let cluster = start(3);
        assert_eq!(cluster.master().master_hostname().as_deref(), Some("localhost"));
        let node = cluster.network(NodeId(2));
        // the announcement is processed by the node's poll
        while node.master_hostname().is_none() {
            node.poll();
            std::thread::yield_now();
        }
        assert_eq!(node.master_hostname().as_deref(), Some("localhost"));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_finalize_stops_every_scheduler() {
        let cluster = start(3);
        let networks: Vec<_> = cluster.nodes().iter().map(|n| n.network.clone()).collect();
        cluster.shutdown().unwrap();
        assert!(networks.iter().all(|net| !net.scheduler().is_running()));
    }

    #[test]
    fn test_only_master_finalizes() {
        let cluster = start(2);
        assert!(matches!(
            cluster.network(NodeId(1)).finalize(),
            Err(TransferError::NotMaster)
        ));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_directory_synchronization() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let key = crate::runtime::directory::RegionKey::new(0xABC0, 0);
        remote.directory().record_write(key, node);
        remote.directory().record_write(key, node);

        master.synchronize_directory(node).unwrap();

        assert_eq!(master.directory().version(key), Some(2));
        assert!(master.directory().holders(key).contains(&node));
        cluster.shutdown().unwrap();
    }

    #[test]
    fn test_directory_reply_larger_than_a_medium_message() {
        use crate::runtime::directory::RegionKey;

        // 24 bytes per region, past the 64 KiB medium limit
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let remote = cluster.network(node);
        let key = |i: u64| RegionKey::new(0x10_0000 + i * 64, 0);
        for i in 0..3000 {
            remote.directory().record_write(key(i), node);
        }

        master.synchronize_directory(node).unwrap();

        assert!((0..3000).all(|i| master.directory().holders(key(i)).contains(&node)));
        assert_eq!(master.directory().version(key(2999)), Some(1));
        assert_eq!(master.fragments.pending(), 0);
        cluster.shutdown().unwrap();
    }
}

#[cfg(test)]
mod failed_send_tests {
    use super::*;
    use crate::network::{FunctionId, TransportError, WorkRequest};

    fn disconnected(err: Result<impl std::fmt::Debug, TransferError>, node: NodeId) {
        match err {
            Err(TransferError::Transport(TransportError::Disconnected(n))) => assert_eq!(n, node),
            other => panic!("expected a disconnected link, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_put_releases_buffer_and_functor() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let src = master.memory().allocate(1024);
        cluster.nodes()[0].transport.sever(node);

        let result = master.put(
            Transfer::new(node, 0x1000, src, 1024),
            Some(Box::new(|| panic!("functor of a failed put ran"))),
        );
        disconnected(result, node);

        let in_use = master.pinned().with_remote(1, |alloc| alloc.allocated_bytes()).unwrap();
        assert_eq!(in_use, 0);
        assert_eq!(master.pending_functors(), 0);
        assert!(cluster.shutdown().is_err());
    }

    #[test]
    fn test_failed_get_releases_pack_buffer() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        let local = master.memory().allocate(64);
        cluster.nodes()[0].transport.sever(node);

        let result = master.get_strided_1d(Transfer::new(node, 0x1000, local, 8), 4, 16);
        disconnected(result, node);

        assert_eq!(master.pending_gets(), 0);
        assert_eq!(master.pinned().with_pack(|alloc| alloc.allocated_bytes()), 0);
        assert!(cluster.shutdown().is_err());
    }

    #[test]
    fn test_failed_relay_request_releases_buffer() {
        let cluster = start(3);
        let master = cluster.master();
        let (source, dest) = (NodeId(1), NodeId(2));
        let to = master.malloc(dest, 128).unwrap();
        cluster.nodes()[0].transport.sever(source);

        let result = master.request_put(
            source,
            Transfer::new(dest, to, 0x1000, 128),
            Some(Box::new(|| {})),
        );
        disconnected(result, source);

        let in_use = master.pinned().with_remote(2, |alloc| alloc.allocated_bytes()).unwrap();
        assert_eq!(in_use, 0);
        assert_eq!(master.pending_functors(), 0);
        assert!(cluster.shutdown().is_err());
    }

    #[test]
    fn test_failed_requests_drop_their_handles() {
        let cluster = start(2);
        let master = cluster.master();
        let node = NodeId(1);
        cluster.nodes()[0].transport.sever(node);

        disconnected(master.malloc(node, 64), node);
        disconnected(master.synchronize_directory(node), node);
        disconnected(
            master.send_work(node, WorkRequest::new(FunctionId(1), WdId(9))),
            node,
        );

        assert!(master.replies.is_empty());
        assert!(master.remote_work.is_empty());
        assert!(cluster.shutdown().is_err());
    }
}
