//! Cluster networking
//!
//! A `Network` is the per-node context every distributed operation goes
//! through. It owns the node's transport endpoint, memory, pinned segments and
//! region directory, and it is handed explicitly to whoever needs to talk to
//! other nodes.
//!
//! Incoming messages are only processed inside `Network::poll`, which idle
//! workers and waiting tasks call through the scheduler's idle hook. Handlers
//! never block and never send; anything that would is pushed onto the
//! deferred queue and drained at the end of the same poll.

pub mod cluster;
pub mod coherence;
pub mod dispatch;
pub mod fabric;
pub mod fragment;
pub mod handle;
mod handlers;
pub mod message;
pub mod sequence;
pub mod transfer;
pub mod transport;

pub use cluster::{ClusterNode, LocalCluster};
pub use dispatch::{
    DefaultTaskFactory, DispatchError, EntryFn, FunctionId, FunctionTable, IncomingWork, RemoteWork,
    TaskFactory, TranslateFn, WorkRequest,
};
pub use fabric::{LocalFabric, LocalTransport};
pub use handle::{HandleRegistry, Token};
pub use message::{ActiveMessage, DecodeError, Stride};
pub use sequence::{SequenceCounter, SequenceGate};
pub use transfer::{Functor, Transfer, TransferError};
pub use transport::{Message, MessageTag, NodeId, Segment, Transport, TransportError, TransportLimits};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::runtime::directory::RegionDirectory;
use crate::runtime::memory::{AddressSpace, MemoryError, PinnedError, PinnedSegments};
use crate::runtime::scheduler::{Architecture, SchedulerCore, SingleSyncCond, TaskGroup};
use coherence::{ArrivalTracker, CoherenceHooks};
use dispatch::WorkBufferManager;
use fragment::FragmentAssembler;
use handlers::Sequenced;
use message::GetRequest;
use transfer::TransferState;

/// Messages handled per poll before the deferred queue gets its turn.
const MAX_MESSAGES_PER_POLL: usize = 256;

/// Cluster-wide settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes, master included
    pub nodes: usize,
    /// Registered segment length per node
    pub segment_len: usize,
    pub limits: TransportLimits,
    /// Hostname the master announces
    pub hostname: String,
    /// Architectures the default task factory accepts
    pub architectures: Vec<Architecture>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            segment_len: 1 << 20,
            limits: TransportLimits::default(),
            hostname: "localhost".to_string(),
            architectures: vec![Architecture::Smp],
        }
    }
}

/// Errors raised while setting a node up.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("{0} has no registered segment")]
    NoSegment(NodeId),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Pinned(#[from] PinnedError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Message and byte counters of one node.
#[derive(Debug, Default)]
pub struct NetworkStats {
    pub messages_sent: AtomicUsize,
    pub messages_received: AtomicUsize,
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
}

impl NetworkStats {
    #[inline]
    pub fn record_sent(
        &self,
        bytes: usize,
    ) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(
        &self,
        bytes: usize,
    ) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn tx(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Payload bytes moved in both directions.
    pub fn total(&self) -> u64 {
        self.tx() + self.rx()
    }
}

/// Work queued by handlers, run at the end of a poll.
pub(crate) enum Deferred {
    Send(NodeId, ActiveMessage),
    ServeGet(NodeId, GetRequest),
    Relay(message::RelayRequest),
    FreeTmpBuffer {
        node: NodeId,
        addr: u64,
        functor: Option<Token>,
    },
    SyncDirectory {
        node: NodeId,
        token: Token,
    },
    Finalize(NodeId),
}

/// A reply some thread is waiting for.
#[derive(Debug, Default)]
pub(crate) struct ReplySlot {
    pub(crate) cond: SingleSyncCond,
    pub(crate) value: AtomicU64,
}

/// Per-node networking context.
pub struct Network {
    node: NodeId,
    num_nodes: usize,
    limits: TransportLimits,
    transport: Arc<dyn Transport>,
    memory: Arc<AddressSpace>,
    pinned: PinnedSegments,
    directory: Arc<RegionDirectory>,
    scheduler: Arc<SchedulerCore>,
    functions: Arc<FunctionTable>,
    factory: Arc<dyn TaskFactory>,
    sequences: SequenceCounter,
    gate: SequenceGate<Sequenced>,
    transfers: TransferState,
    work_buffers: WorkBufferManager,
    /// Split medium payloads being rebuilt
    fragments: FragmentAssembler,
    arrivals: Mutex<ArrivalTracker>,
    /// Origin side of offloaded work
    remote_work: HandleRegistry<Arc<RemoteWork>>,
    /// Reconstructed work, one group per architecture
    remote_groups: [Arc<TaskGroup>; 3],
    replies: HandleRegistry<Arc<ReplySlot>>,
    deferred: SegQueue<Deferred>,
    /// Held while messages are being handled
    am_lock: Mutex<()>,
    finalize: Mutex<Option<Arc<ReplySlot>>>,
    master_hostname: RwLock<Option<String>>,
    stats: NetworkStats,
}

impl fmt::Debug for Network {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Network")
            .field("node", &self.node)
            .field("num_nodes", &self.num_nodes)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl Network {
    /// Bring up the networking context of the transport's node.
    ///
    /// Maps the node's registered segment, builds the pinned allocators and
    /// installs the coherence hooks and the network poll on `scheduler`.
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<SchedulerCore>,
        functions: Arc<FunctionTable>,
        factory: Arc<dyn TaskFactory>,
    ) -> Result<Arc<Self>, NetworkError> {
        let node = transport.node_id();
        let num_nodes = transport.num_nodes();
        let segments = (0..num_nodes)
            .map(|i| {
                let id = NodeId::from(i);
                transport
                    .segment(id)
                    .map(|s| (s.base, s.len))
                    .ok_or(NetworkError::NoSegment(id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let memory = Arc::new(AddressSpace::new());
        let (base, len) = segments[node.index()];
        memory.map(base, len)?;
        let pinned = PinnedSegments::new(node.index(), &segments)?;

        let network = Arc::new(Self {
            node,
            num_nodes,
            limits: transport.limits(),
            transport,
            memory,
            pinned,
            directory: Arc::new(RegionDirectory::new()),
            scheduler,
            functions,
            factory,
            sequences: SequenceCounter::new(num_nodes),
            gate: SequenceGate::new(),
            transfers: TransferState::default(),
            work_buffers: WorkBufferManager::new(),
            fragments: FragmentAssembler::new(),
            arrivals: Mutex::new(ArrivalTracker::default()),
            remote_work: HandleRegistry::new(),
            remote_groups: [
                Arc::new(TaskGroup::new("remote-smp")),
                Arc::new(TaskGroup::new("remote-gpu")),
                Arc::new(TaskGroup::new("remote-opencl")),
            ],
            replies: HandleRegistry::new(),
            deferred: SegQueue::new(),
            am_lock: Mutex::new(()),
            finalize: Mutex::new(None),
            master_hostname: RwLock::new(None),
            stats: NetworkStats::default(),
        });

        let weak: Weak<Network> = Arc::downgrade(&network);
        network
            .scheduler
            .set_hooks(Arc::new(CoherenceHooks::new(weak.clone())));
        network.scheduler.set_idle_hook(Arc::new(move || {
            if let Some(network) = weak.upgrade() {
                network.poll();
            }
        }));

        tracing::debug!(node = %node, nodes = num_nodes, segment = format_args!("{base:#x}+{len}"), "network up");
        Ok(network)
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.node.is_master()
    }

    #[inline]
    pub fn limits(&self) -> TransportLimits {
        self.limits
    }

    /// This node's memory.
    #[inline]
    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.memory
    }

    #[inline]
    pub fn pinned(&self) -> &PinnedSegments {
        &self.pinned
    }

    #[inline]
    pub fn directory(&self) -> &Arc<RegionDirectory> {
        &self.directory
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<SchedulerCore> {
        &self.scheduler
    }

    #[inline]
    pub fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    #[inline]
    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Group of reconstructed tasks built for `arch`.
    #[inline]
    pub fn remote_group(
        &self,
        arch: Architecture,
    ) -> &Arc<TaskGroup> {
        &self.remote_groups[arch.index()]
    }

    /// Whether no reconstructed task is still live.
    pub fn remote_work_idle(&self) -> bool {
        self.remote_groups.iter().all(|group| group.is_idle())
    }

    /// Sequence number the next ordered message to `dest` will carry.
    #[inline]
    pub fn next_sequence(
        &self,
        dest: NodeId,
    ) -> u64 {
        self.sequences.peek(dest)
    }

    /// Hostname announced by the master, once known.
    pub fn master_hostname(&self) -> Option<String> {
        self.master_hostname.read().clone()
    }

    /// Number of queued deferred operations.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn check_node(
        &self,
        node: NodeId,
    ) -> Result<(), TransferError> {
        if node.index() >= self.num_nodes {
            return Err(TransferError::UnknownNode(node));
        }
        Ok(())
    }

    /// Send a message now, logging a failure.
    ///
    /// Payloads of split tags go out in pieces that fit the medium limit.
    pub(crate) fn send(
        &self,
        dest: NodeId,
        message: ActiveMessage,
    ) -> Result<(), TransportError> {
        let message = message.into_message();
        let tag = message.tag;
        let pieces = if tag.is_split() {
            fragment::split(message, self.limits.max_medium)
        } else {
            smallvec::smallvec![message]
        };
        for piece in pieces {
            let len = piece.payload.len();
            if let Err(err) = self.transport.send(dest, piece) {
                tracing::error!(from = %self.node, to = %dest, ?tag, "send failed: {}", err);
                return Err(err);
            }
            self.stats.record_sent(len);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn defer(
        &self,
        op: Deferred,
    ) {
        self.deferred.push(op);
    }

    /// Process incoming messages, then run deferred work.
    ///
    /// Returns at once when another thread is already polling.
    pub fn poll(&self) {
        let Some(_guard) = self.am_lock.try_lock() else {
            return;
        };

        for _ in 0..MAX_MESSAGES_PER_POLL {
            let Some((source, message)) = self.transport.poll() else {
                break;
            };
            self.receive(source, message);
        }
        self.drain_deferred();
    }

    fn receive(
        &self,
        source: NodeId,
        message: Message,
    ) {
        self.stats.record_received(message.payload.len());
        if let Some(landing) = message.landing {
            if let Err(err) = self.memory.write(landing, &message.payload) {
                tracing::error!(%source, tag = ?message.tag, "dropping long message: {}", err);
                return;
            }
        }
        let message = if message.tag.is_split() {
            match self.fragments.accept(source, message) {
                Some(whole) => whole,
                None => return,
            }
        } else {
            message
        };
        match ActiveMessage::from_message(&message) {
            Ok(decoded) => self.handle(source, decoded),
            Err(err) => tracing::warn!(%source, "malformed message: {}", err),
        }
    }

    /// Run the operations queued so far. Operations queued while draining
    /// wait for the next poll.
    fn drain_deferred(&self) {
        for _ in 0..self.deferred.len() {
            let Some(op) = self.deferred.pop() else {
                break;
            };
            match op {
                Deferred::Send(dest, message) => {
                    let _ = self.send(dest, message);
                },
                Deferred::ServeGet(source, request) => self.serve_get(source, request),
                Deferred::Relay(request) => self.relay_put(request),
                Deferred::FreeTmpBuffer {
                    node,
                    addr,
                    functor,
                } => self.release_tmp_buffer(node, addr, functor),
                Deferred::SyncDirectory { node, token } => self.answer_directory_sync(node, token),
                Deferred::Finalize(master) => {
                    tracing::debug!(node = %self.node, "finalizing");
                    self.scheduler.stop();
                    let _ = self.send(master, ActiveMessage::FinalizeReply);
                },
            }
        }
    }

    /// Tell every node that the master is reachable under `hostname`.
    pub fn announce_master(
        &self,
        hostname: &str,
    ) -> Result<(), TransferError> {
        if !self.is_master() {
            return Err(TransferError::NotMaster);
        }
        *self.master_hostname.write() = Some(hostname.to_string());
        for i in 1..self.num_nodes {
            self.send(NodeId::from(i), ActiveMessage::MasterHostname(hostname.to_string()))?;
        }
        Ok(())
    }

    /// Stop every node. Master only; returns once all nodes answered.
    pub fn finalize(&self) -> Result<(), TransferError> {
        if !self.is_master() {
            return Err(TransferError::NotMaster);
        }
        let slot = Arc::new(ReplySlot::default());
        *self.finalize.lock() = Some(slot.clone());
        if self.num_nodes == 1 {
            slot.cond.set();
        }
        for i in 1..self.num_nodes {
            self.send(NodeId::from(i), ActiveMessage::Finalize)?;
        }
        self.scheduler.wait_on_condition(&slot.cond);
        tracing::info!(nodes = self.num_nodes, "cluster finalized");
        self.scheduler.stop();
        Ok(())
    }

    /// Wait at the transport barrier.
    pub fn barrier(&self) -> Result<(), TransportError> {
        self.transport.barrier()
    }
}

#[cfg(test)]
mod tests;
