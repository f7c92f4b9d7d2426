//! In-process cluster
//!
//! Runs every node of a job inside one process over a `LocalFabric`. Each
//! node gets its own scheduler and `Network`; the nodes share nothing but the
//! fabric and the function table.

use std::sync::Arc;

use super::dispatch::{DefaultTaskFactory, FunctionTable};
use super::fabric::{LocalFabric, LocalTransport};
use super::transport::NodeId;
use super::{ClusterConfig, Network, NetworkError, TransferError};
use crate::runtime::scheduler::{Scheduler, SchedulerConfig};

/// One node of a `LocalCluster`.
#[derive(Debug)]
pub struct ClusterNode {
    pub scheduler: Scheduler,
    pub network: Arc<Network>,
    pub transport: Arc<LocalTransport>,
}

/// Every node of a job, in node order.
#[derive(Debug)]
pub struct LocalCluster {
    nodes: Vec<ClusterNode>,
    functions: Arc<FunctionTable>,
}

impl LocalCluster {
    /// Start all nodes with an empty function table.
    pub fn start(
        cluster: &ClusterConfig,
        scheduler: &SchedulerConfig,
    ) -> Result<Self, NetworkError> {
        Self::with_functions(cluster, scheduler, Arc::new(FunctionTable::new()))
    }

    /// Start all nodes sharing `functions`, then announce the master.
    pub fn with_functions(
        cluster: &ClusterConfig,
        scheduler: &SchedulerConfig,
        functions: Arc<FunctionTable>,
    ) -> Result<Self, NetworkError> {
        let transports = LocalFabric::new(cluster.nodes.max(1))
            .limits(cluster.limits)
            .segment_len(cluster.segment_len)
            .build();

        let nodes = transports
            .into_iter()
            .map(|transport| -> Result<ClusterNode, NetworkError> {
                let node_scheduler = Scheduler::with_config(scheduler.clone());
                let network = Network::new(
                    transport.clone(),
                    node_scheduler.handle(),
                    functions.clone(),
                    Arc::new(DefaultTaskFactory::new(cluster.architectures.clone())),
                )?;
                Ok(ClusterNode {
                    scheduler: node_scheduler,
                    network,
                    transport,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cluster_up = Self { nodes, functions };
        cluster_up.master().announce_master(&cluster.hostname)?;
        tracing::info!(nodes = cluster_up.len(), "cluster started");
        Ok(cluster_up)
    }

    /// Network context of the master node.
    #[inline]
    pub fn master(&self) -> &Arc<Network> {
        &self.nodes[0].network
    }

    pub fn node(
        &self,
        id: NodeId,
    ) -> Option<&ClusterNode> {
        self.nodes.get(id.index())
    }

    /// Network context of `id`.
    ///
    /// # Panics
    /// If `id` is not part of the cluster.
    pub fn network(
        &self,
        id: NodeId,
    ) -> &Arc<Network> {
        &self.nodes[id.index()].network
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    /// Finalize through the master and join every worker.
    pub fn shutdown(self) -> Result<(), TransferError> {
        let result = self.master().finalize();
        for node in &self.nodes {
            node.scheduler.shutdown();
        }
        result
    }
}
