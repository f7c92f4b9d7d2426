//! Transport abstraction
//!
//! The runtime talks to the fabric only through the `Transport` trait: send
//! an active message to a node, poll for incoming ones, and synchronize all
//! nodes with a barrier. Messages carry native 64-bit arguments plus an
//! optional payload. A payload with a `landing` address is a long message:
//! the receiving side stores it at that address in its registered segment
//! before the handler runs.

use std::fmt;

use bytes::Bytes;
use smallvec::SmallVec;

/// Identity of a cluster node. Node 0 is the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The master node.
    pub const MASTER: NodeId = NodeId(0);

    /// Get the inner value as an index.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }
}

impl From<usize> for NodeId {
    fn from(val: usize) -> Self {
        Self(val as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Protocol message tags. The numeric values are protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageTag {
    Finalize = 203,
    FinalizeReply = 204,
    Work = 205,
    WorkDone = 206,
    Malloc = 207,
    MallocReply = 208,
    MasterHostname = 209,
    Put = 210,
    Get = 211,
    GetReply = 212,
    PutFill = 213,
    RequestPut = 214,
    WorkData = 215,
    Free = 216,
    Realloc = 217,
    WaitRequestPut = 218,
    FreeTmpBuffer = 219,
    PutStrided = 220,
    GetStrided = 221,
    RequestPutStrided = 222,
    GetReplyStrided = 223,
    RegionMetadata = 224,
    SynchronizeDirectory = 225,
}

impl MessageTag {
    /// Every tag, in protocol order.
    pub const ALL: [MessageTag; 23] = [
        MessageTag::Finalize,
        MessageTag::FinalizeReply,
        MessageTag::Work,
        MessageTag::WorkDone,
        MessageTag::Malloc,
        MessageTag::MallocReply,
        MessageTag::MasterHostname,
        MessageTag::Put,
        MessageTag::Get,
        MessageTag::GetReply,
        MessageTag::PutFill,
        MessageTag::RequestPut,
        MessageTag::WorkData,
        MessageTag::Free,
        MessageTag::Realloc,
        MessageTag::WaitRequestPut,
        MessageTag::FreeTmpBuffer,
        MessageTag::PutStrided,
        MessageTag::GetStrided,
        MessageTag::RequestPutStrided,
        MessageTag::GetReplyStrided,
        MessageTag::RegionMetadata,
        MessageTag::SynchronizeDirectory,
    ];

    #[inline]
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Convert from the wire value.
    pub fn from_u16(val: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.as_u16() == val)
    }

    /// Medium messages whose payload may exceed one medium message and is
    /// therefore sent in fragments.
    #[inline]
    pub fn is_split(&self) -> bool {
        matches!(
            self,
            MessageTag::Get
                | MessageTag::GetStrided
                | MessageTag::RegionMetadata
                | MessageTag::SynchronizeDirectory
                | MessageTag::MasterHostname
        )
    }
}

/// Argument list of a message.
pub type Args = SmallVec<[u64; 16]>;

/// One active message.
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: MessageTag,
    pub args: Args,
    pub payload: Bytes,
    /// Destination address of a long payload in the receiver's segment
    pub landing: Option<u64>,
}

impl Message {
    /// A message with arguments only.
    pub fn short(
        tag: MessageTag,
        args: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            tag,
            args: args.into_iter().collect(),
            payload: Bytes::new(),
            landing: None,
        }
    }

    /// A message whose payload is handed to the handler.
    pub fn medium(
        tag: MessageTag,
        args: impl IntoIterator<Item = u64>,
        payload: Bytes,
    ) -> Self {
        Self {
            tag,
            args: args.into_iter().collect(),
            payload,
            landing: None,
        }
    }

    /// A message whose payload lands at `landing` before the handler runs.
    pub fn long(
        tag: MessageTag,
        args: impl IntoIterator<Item = u64>,
        payload: Bytes,
        landing: u64,
    ) -> Self {
        Self {
            tag,
            args: args.into_iter().collect(),
            payload,
            landing: Some(landing),
        }
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        self.landing.is_some()
    }
}

/// Payload size limits of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Largest medium payload
    pub max_medium: usize,
    /// Largest long payload in a request
    pub max_long_request: usize,
    /// Largest long payload in a reply
    pub max_long_reply: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_medium: 64 * 1024,
            max_long_request: 64 * 1024,
            max_long_reply: 64 * 1024,
        }
    }
}

/// A node's registered memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub len: usize,
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is not part of the fabric")]
    UnknownNode(NodeId),
    #[error("link to {0} is closed")]
    Disconnected(NodeId),
    #[error("{tag:?} payload of {len} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        tag: MessageTag,
        len: usize,
        limit: usize,
    },
    #[error("barrier failed: {0}")]
    Barrier(String),
}

/// Active-message transport.
///
/// Delivery between one pair of nodes is in order. Implementations must be
/// usable from any thread.
pub trait Transport: Send + Sync + fmt::Debug {
    /// This node.
    fn node_id(&self) -> NodeId;

    /// Number of nodes in the job.
    fn num_nodes(&self) -> usize;

    /// Payload limits; senders fragment to these.
    fn limits(&self) -> TransportLimits;

    /// Registered segment of `node`.
    fn segment(
        &self,
        node: NodeId,
    ) -> Option<Segment>;

    /// Send one message. Never blocks on the receiver.
    fn send(
        &self,
        dest: NodeId,
        message: Message,
    ) -> Result<(), TransportError>;

    /// Take the next incoming message, if any.
    fn poll(&self) -> Option<(NodeId, Message)>;

    /// Wait until every node reached the barrier.
    fn barrier(&self) -> Result<(), TransportError>;
}
