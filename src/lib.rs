//! nodeflow
//!
//! Distributed memory coherence and task offload for cluster runtimes, on top
//! of a cooperative task scheduler.
//!
//! Every node runs a [`runtime::scheduler::Scheduler`] and a
//! [`network::Network`] context. The master moves data with PUT/GET
//! transfers through pinned temporary buffers, offloads work descriptors to
//! other nodes and keeps the region directory coherent.
//!
//! # Example
//!
//! ```no_run
//! use nodeflow::{run_demo, Result};
//! use nodeflow::util::config::RuntimeConfig;
//!
//! fn main() -> Result<()> {
//!     let report = run_demo(&RuntimeConfig::default(), 4096)?;
//!     assert!(report.verified);
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod network;
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::network::{FunctionId, FunctionTable, LocalCluster, NodeId, Transfer};
use crate::runtime::memory::AddressSpace;
use crate::runtime::scheduler::{SingleSyncCond, TaskContext};
use crate::util::config::RuntimeConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "nodeflow";

/// Entry point the demo offloads: doubles `len` bytes at `addr`.
pub const DEMO_SCALE: FunctionId = FunctionId(1);

/// Traffic of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTraffic {
    pub node: NodeId,
    pub tx: u64,
    pub rx: u64,
}

impl NodeTraffic {
    #[inline]
    pub fn total(&self) -> u64 {
        self.tx + self.rx
    }
}

/// Outcome of [`run_demo`].
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub nodes: usize,
    pub bytes: usize,
    /// Data read back matched the expected result
    pub verified: bool,
    /// Worker that ran the offloaded task
    pub executed_by: Option<u64>,
    pub traffic: Vec<NodeTraffic>,
}

fn scale_table() -> Arc<FunctionTable> {
    let functions = FunctionTable::new();
    functions.register_entry(
        DEMO_SCALE,
        Arc::new(|ctx: &TaskContext<'_>, memory: &AddressSpace| {
            let mut args = ctx.args().clone();
            if args.remaining() < 16 {
                tracing::error!(wd = %ctx.wd().id(), "scale: short argument block");
                return;
            }
            let addr = args.get_u64_le();
            let len = args.get_u64_le() as usize;
            let scaled = memory
                .read(addr, len)
                .map(|data| data.iter().map(|b| b.wrapping_mul(2)).collect::<Vec<_>>())
                .and_then(|data| memory.write(addr, &data));
            if let Err(err) = scaled {
                tracing::error!(wd = %ctx.wd().id(), "scale: {}", err);
            }
        }),
    );
    Arc::new(functions)
}

/// Run one round trip on an in-process cluster.
///
/// The master allocates `bytes` on the last node, offloads a task there that
/// waits for its input, pushes the input, reads the result back and
/// finalizes the cluster.
pub fn run_demo(
    config: &RuntimeConfig,
    bytes: usize,
) -> Result<DemoReport> {
    let cluster_config = config.cluster_config();
    let cluster = LocalCluster::with_functions(
        &cluster_config,
        &config.scheduler_config(),
        scale_table(),
    )
    .context("Failed to start cluster")?;
    let master = cluster.master().clone();
    let target = NodeId::from(cluster.len() - 1);
    debug!(nodes = cluster.len(), %target, bytes, "demo started");

    let input: Vec<u8> = (0..bytes).map(|i| (i % 100) as u8).collect();
    let local = master.memory().allocate(bytes);
    master.memory().write(local, &input)?;
    let remote_addr = master.malloc(target, bytes).context("remote malloc")?;

    let owner = master.scheduler().next_id();
    let mut args = BytesMut::with_capacity(16);
    args.put_u64_le(remote_addr);
    args.put_u64_le(bytes as u64);
    let work = network::WorkRequest::new(DEMO_SCALE, owner)
        .args(args.freeze())
        .expected_data(bytes as u64);
    let remote = master.send_work(target, work).context("offload")?;

    let pushed = Arc::new(SingleSyncCond::new());
    let signal = pushed.clone();
    master
        .put(
            Transfer::new(target, remote_addr, local, bytes as u64).owner(owner),
            Some(Box::new(move || signal.set())),
        )
        .context("put")?;
    master.wait(&*pushed);
    master.wait(&*remote);

    let fetched = master.get(Transfer::new(target, remote_addr, local, bytes as u64))?;
    master.wait(&*fetched);
    let output = master.memory().read(local, bytes)?;
    let verified = output
        .iter()
        .zip(&input)
        .all(|(out, inp)| *out == inp.wrapping_mul(2));
    master.free(target, remote_addr)?;

    let traffic = cluster
        .nodes()
        .iter()
        .map(|node| NodeTraffic {
            node: node.network.node_id(),
            tx: node.network.stats().tx(),
            rx: node.network.stats().rx(),
        })
        .collect();
    let report = DemoReport {
        nodes: cluster.len(),
        bytes,
        verified,
        executed_by: remote.executed_by(),
        traffic,
    };
    cluster.shutdown().context("finalize")?;
    Ok(report)
}
