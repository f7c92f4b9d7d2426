//! In-process loopback fabric.
//!
//! `LocalFabric::build` wires N `LocalTransport`s together with unbounded
//! crossbeam channels, one inbox per node. A channel preserves the order of
//! messages from one sender, which gives the per-pair ordering the protocol
//! relies on. Segments are laid out at power-of-two aligned bases so that
//! pinned allocations of any size up to half a segment can be satisfied.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use super::transport::{Message, NodeId, Segment, Transport, TransportError, TransportLimits};

/// Base address of node 0's registered segment.
pub const SEGMENT_BASE: u64 = 0x100_0000_0000;

/// Builder for a set of connected loopback transports.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    nodes: usize,
    limits: TransportLimits,
    segment_len: usize,
}

impl LocalFabric {
    /// A fabric of `nodes` nodes with default limits and 1 MiB segments.
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            limits: TransportLimits::default(),
            segment_len: 1 << 20,
        }
    }

    pub fn limits(
        mut self,
        limits: TransportLimits,
    ) -> Self {
        self.limits = limits;
        self
    }

    /// Segment length, rounded up to a power of two.
    pub fn segment_len(
        mut self,
        len: usize,
    ) -> Self {
        self.segment_len = len.next_power_of_two();
        self
    }

    /// Create the transports, one per node, in node order.
    pub fn build(self) -> Vec<Arc<LocalTransport>> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.nodes).map(|_| unbounded()).unzip();
        let senders = Arc::new(senders);
        let stride = (self.segment_len as u64).max(SEGMENT_BASE);
        let segments: Arc<Vec<Segment>> = Arc::new(
            (0..self.nodes)
                .map(|i| Segment {
                    base: SEGMENT_BASE + i as u64 * stride,
                    len: self.segment_len,
                })
                .collect(),
        );
        let barrier = Arc::new(Barrier::new(self.nodes.max(1)));

        receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| {
                Arc::new(LocalTransport {
                    id: NodeId::from(i),
                    senders: senders.clone(),
                    inbox,
                    limits: self.limits,
                    segments: segments.clone(),
                    barrier: barrier.clone(),
                    severed: RwLock::new(HashSet::new()),
                })
            })
            .collect()
    }
}

/// One node's end of a `LocalFabric`.
#[derive(Debug)]
pub struct LocalTransport {
    id: NodeId,
    senders: Arc<Vec<Sender<(NodeId, Message)>>>,
    inbox: Receiver<(NodeId, Message)>,
    limits: TransportLimits,
    segments: Arc<Vec<Segment>>,
    barrier: Arc<Barrier>,
    /// Links that refuse to carry messages
    severed: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    /// Make every send to `dest` fail.
    pub fn sever(
        &self,
        dest: NodeId,
    ) {
        self.severed.write().insert(dest);
    }

    /// Number of messages waiting in this node's inbox.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    fn check_payload(
        &self,
        message: &Message,
    ) -> Result<(), TransportError> {
        let limit = if message.is_long() {
            self.limits.max_long_request.max(self.limits.max_long_reply)
        } else {
            self.limits.max_medium
        };
        if message.payload.len() > limit {
            return Err(TransportError::PayloadTooLarge {
                tag: message.tag,
                len: message.payload.len(),
                limit,
            });
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn num_nodes(&self) -> usize {
        self.senders.len()
    }

    fn limits(&self) -> TransportLimits {
        self.limits
    }

    fn segment(
        &self,
        node: NodeId,
    ) -> Option<Segment> {
        self.segments.get(node.index()).copied()
    }

    fn send(
        &self,
        dest: NodeId,
        message: Message,
    ) -> Result<(), TransportError> {
        if self.severed.read().contains(&dest) {
            return Err(TransportError::Disconnected(dest));
        }
        self.check_payload(&message)?;
        let sender = self
            .senders
            .get(dest.index())
            .ok_or(TransportError::UnknownNode(dest))?;
        tracing::trace!(from = %self.id, to = %dest, tag = ?message.tag, len = message.payload.len(), "send");
        sender
            .send((self.id, message))
            .map_err(|_| TransportError::Disconnected(dest))
    }

    fn poll(&self) -> Option<(NodeId, Message)> {
        self.inbox.try_recv().ok()
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.barrier.wait();
        Ok(())
    }
}
