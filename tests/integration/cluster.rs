//! Cluster integration tests
//!
//! Offloading work between in-process nodes and keeping the region
//! directory coherent.

use bytes::Bytes;
use nodeflow::network::{
    ClusterConfig, FunctionId, FunctionTable, LocalCluster, NodeId, Transfer, TransportLimits,
    WorkRequest,
};
use nodeflow::runtime::memory::AddressSpace;
use nodeflow::runtime::scheduler::{
    Architecture, CopyFlags, CopySet, SchedulerConfig, TaskContext, TaskGroup, WdId,
    WorkDescriptor,
};
use nodeflow::util::config::RuntimeConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RECORD: FunctionId = FunctionId(7);

/// Entry that records the arguments and the first byte of every copy.
fn recording_table(log: Arc<Mutex<Vec<(Bytes, Vec<u8>)>>>) -> Arc<FunctionTable> {
    let functions = FunctionTable::new();
    functions.register_entry(
        RECORD,
        Arc::new(move |ctx: &TaskContext<'_>, memory: &AddressSpace| {
            let firsts = ctx
                .wd()
                .copies()
                .iter()
                .map(|copy| memory.read(copy.address, 1).map(|b| b[0]).unwrap_or(0))
                .collect();
            log.lock().push((ctx.args().clone(), firsts));
        }),
    );
    Arc::new(functions)
}

fn start(
    nodes: usize,
    limits: TransportLimits,
    functions: Arc<FunctionTable>,
) -> LocalCluster {
    let cluster = ClusterConfig {
        nodes,
        limits,
        segment_len: 256 * 1024,
        ..ClusterConfig::default()
    };
    let scheduler = SchedulerConfig {
        num_workers: 2,
        default_stack_size: 256 * 1024,
        ..SchedulerConfig::default()
    };
    LocalCluster::with_functions(&cluster, &scheduler, functions).unwrap()
}

/// Poll until `check` holds.
fn eventually(
    what: &str,
    mut check: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_offloaded_task_waits_for_its_input() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = start(2, TransportLimits::default(), recording_table(log.clone()));
    let master = cluster.master();
    let node = NodeId(1);

    let data = vec![42u8; 256];
    let local = master.memory().allocate(data.len());
    master.memory().write(local, &data).unwrap();
    let remote_addr = master.malloc(node, data.len()).unwrap();

    let owner = master.scheduler().next_id();
    let (copies, dims) = CopySet::new()
        .add(
            remote_addr,
            CopyFlags::INOUT,
            &[nodeflow::runtime::scheduler::RegionDimension::whole(256)],
            local,
            0,
        )
        .finish();
    let region = copies[0].region();
    let work = master
        .send_work(
            node,
            WorkRequest::new(RECORD, owner)
                .args(Bytes::from_static(b"job"))
                .copies(copies, dims)
                .expected_data(256),
        )
        .unwrap();

    let remote = cluster.network(node);
    eventually("task to wait for data", || remote.tasks_waiting_for_data() == 1);
    assert!(!work.is_done());
    assert!(log.lock().is_empty());

    master
        .put(Transfer::new(node, remote_addr, local, 256).owner(owner), None)
        .unwrap();
    master.wait(&*work);

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, Bytes::from_static(b"job"));
    assert_eq!(entries[0].1, vec![42]);
    assert!(work.executed_by().is_some());
    assert_eq!(remote.tasks_waiting_for_data(), 0);
    // the executing node holds the output
    assert!(master.directory().holders(region).contains(&node));
    cluster.shutdown().unwrap();
}

#[test]
fn test_fragmented_work_is_reassembled() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let limits = TransportLimits {
        max_medium: 16,
        ..TransportLimits::default()
    };
    let cluster = start(2, limits, recording_table(log.clone()));
    let master = cluster.master();

    let args: Vec<u8> = (0..100u8).collect();
    let (copies, dims) = CopySet::new()
        .linear(0x9000, 64, CopyFlags::IN)
        .linear(0xA000, 64, CopyFlags::OUT)
        .finish();
    let sent_before = master.stats().messages_sent.load(std::sync::atomic::Ordering::Relaxed);
    let work = master
        .send_work(
            NodeId(1),
            WorkRequest::new(RECORD, WdId(900))
                .args(args.clone())
                .copies(copies, dims),
        )
        .unwrap();
    master.wait(&*work);

    let sent = master.stats().messages_sent.load(std::sync::atomic::Ordering::Relaxed) - sent_before;
    assert!(sent > 10, "only {} messages for a fragmented block", sent);
    let entries = log.lock().clone();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.as_ref(), &args[..]);
    assert_eq!(entries[0].1.len(), 2);
    cluster.shutdown().unwrap();
}

#[test]
fn test_unsupported_architecture_is_dropped() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = start(2, TransportLimits::default(), recording_table(log.clone()));
    let master = cluster.master();
    let node = NodeId(1);
    let input = master.memory().allocate(64);
    let dest = master.malloc(node, 128).unwrap();

    // half of the input lands before the work, half after it was dropped
    master
        .put(Transfer::new(node, dest, input, 64).owner(WdId(5)), None)
        .unwrap();
    let work = master
        .send_work(
            node,
            WorkRequest::new(RECORD, WdId(5))
                .arch(Architecture::Gpu)
                .expected_data(128),
        )
        .unwrap();
    master
        .put(Transfer::new(node, dest + 64, input, 64).owner(WdId(5)), None)
        .unwrap();
    // an unknown entry is dropped the same way
    let unknown = master
        .send_work(node, WorkRequest::new(FunctionId(999), WdId(6)))
        .unwrap();
    // a malloc round trip orders after both work messages
    master.malloc(node, 8).unwrap();

    let remote = cluster.network(node);
    assert!(remote.remote_work_idle());
    assert_eq!(remote.tasks_waiting_for_data(), 0);
    assert_eq!(remote.unclaimed_arrivals(), 0);
    assert!(!work.is_done());
    assert!(!unknown.is_done());
    assert!(log.lock().is_empty());
    cluster.shutdown().unwrap();
}

#[test]
fn test_write_after_write_bumps_versions() {
    let cluster = start(2, TransportLimits::default(), Arc::new(FunctionTable::new()));
    let master = cluster.master().clone();
    let scheduler = cluster.nodes()[0].scheduler.handle();
    let group = Arc::new(TaskGroup::new("waw"));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let buffer = master.memory().allocate(128);
    for _ in 0..2 {
        let (copies, dims) = CopySet::new()
            .linear(buffer, 128, CopyFlags::OUT)
            .finish();
        let region = copies[0].region();
        let (net, seen) = (master.clone(), seen.clone());
        let task = WorkDescriptor::builder()
            .copies(copies, dims)
            .parent(&group)
            .build(scheduler.next_id(), move |_| {
                seen.lock().push(net.directory().version(region));
            });
        scheduler.submit(task);
    }
    scheduler.wait_completion(&group);

    assert_eq!(*seen.lock(), vec![Some(1), Some(2)]);
    cluster.shutdown().unwrap();
}

#[test]
fn test_demo_round_trip() {
    let mut config = RuntimeConfig::default();
    config.cluster.nodes = 3;
    config.scheduler.workers = Some(2);
    config.scheduler.stack_size = 256 * 1024;
    config.cluster.max_long_request = 1024;

    let report = nodeflow::run_demo(&config, 10_000).unwrap();
    assert!(report.verified);
    assert_eq!(report.nodes, 3);
    assert!(report.executed_by.is_some());
    let target = &report.traffic[2];
    assert!(target.rx >= 10_000);
    assert!(target.tx >= 10_000);
    // the idle middle node only heard the hostname and finalize
    assert!(report.traffic[1].total() < 100);
}
