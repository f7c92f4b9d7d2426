//! Pinned segment bookkeeping for one node.
//!
//! The master owns one allocator per node, covering the first half of that
//! node's registered segment; temporary PUT buffers on any node are carved
//! from there. Every node also owns a pack allocator over the second half of
//! its own segment, used to pack strided data before sending and to land
//! strided replies.
//!
//! Each allocator sits behind its own lock. The lock is never held while
//! polling the network: the blocking variants unlock, poll, relock and retry.

use parking_lot::Mutex;

use super::allocator::{AllocError, SimpleAllocator};

/// Errors raised by `PinnedSegments`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinnedError {
    #[error("only the master node keeps allocators for remote segments")]
    NotMaster,
    #[error("node {0} has no registered segment")]
    UnknownNode(usize),
    #[error("request of {size} bytes can never fit the {capacity} byte segment")]
    TooLarge { size: usize, capacity: usize },
    #[error("zero-byte pinned allocation")]
    Empty,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Per-node pinned allocators.
#[derive(Debug)]
pub struct PinnedSegments {
    /// Index of the owning node
    node: usize,
    /// Master only: first half of every node's segment
    remote: Vec<Mutex<SimpleAllocator>>,
    /// Second half of this node's own segment
    pack: Mutex<SimpleAllocator>,
}

impl PinnedSegments {
    /// Build the allocators for `node` given every node's `(base, len)` segment.
    pub fn new(
        node: usize,
        segments: &[(u64, usize)],
    ) -> Result<Self, PinnedError> {
        let &(base, len) = segments.get(node).ok_or(PinnedError::UnknownNode(node))?;
        let half = len / 2;

        let remote = if node == 0 {
            segments
                .iter()
                .map(|&(base, len)| Mutex::new(SimpleAllocator::new(base, len / 2)))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            node,
            remote,
            pack: Mutex::new(SimpleAllocator::new(base + half as u64, len - half)),
        })
    }

    /// Whether this node owns the remote allocators.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.node == 0
    }

    fn remote(
        &self,
        node: usize,
    ) -> Result<&Mutex<SimpleAllocator>, PinnedError> {
        if !self.is_master() {
            return Err(PinnedError::NotMaster);
        }
        self.remote.get(node).ok_or(PinnedError::UnknownNode(node))
    }

    /// Try once to get a temporary buffer inside `node`'s segment.
    pub fn try_allocate(
        &self,
        node: usize,
        size: usize,
    ) -> Result<Option<u64>, PinnedError> {
        let allocator = self.remote(node)?;
        check_request(allocator, size)?;
        Ok(allocator.lock().allocate(size))
    }

    /// Get a temporary buffer inside `node`'s segment, polling until one is free.
    pub fn allocate_blocking(
        &self,
        node: usize,
        size: usize,
        poll: impl FnMut(),
    ) -> Result<u64, PinnedError> {
        let allocator = self.remote(node)?;
        allocate_with_retry(allocator, size, poll)
    }

    /// Return a temporary buffer to `node`'s allocator.
    pub fn free(
        &self,
        node: usize,
        addr: u64,
    ) -> Result<usize, PinnedError> {
        Ok(self.remote(node)?.lock().free(addr)?)
    }

    /// Get a pack buffer in this node's own segment, polling until one is free.
    pub fn pack_allocate_blocking(
        &self,
        size: usize,
        poll: impl FnMut(),
    ) -> Result<u64, PinnedError> {
        allocate_with_retry(&self.pack, size, poll)
    }

    /// Return a pack buffer.
    pub fn pack_free(
        &self,
        addr: u64,
    ) -> Result<usize, PinnedError> {
        Ok(self.pack.lock().free(addr)?)
    }

    /// Inspect the allocator for `node` (master only).
    pub fn with_remote<R>(
        &self,
        node: usize,
        f: impl FnOnce(&SimpleAllocator) -> R,
    ) -> Result<R, PinnedError> {
        Ok(f(&self.remote(node)?.lock()))
    }

    /// Inspect this node's pack allocator.
    pub fn with_pack<R>(
        &self,
        f: impl FnOnce(&SimpleAllocator) -> R,
    ) -> R {
        f(&self.pack.lock())
    }
}

fn check_request(
    allocator: &Mutex<SimpleAllocator>,
    size: usize,
) -> Result<(), PinnedError> {
    if size == 0 {
        return Err(PinnedError::Empty);
    }
    let capacity = allocator.lock().capacity();
    if size > capacity {
        return Err(PinnedError::TooLarge { size, capacity });
    }
    Ok(())
}

fn allocate_with_retry(
    allocator: &Mutex<SimpleAllocator>,
    size: usize,
    mut poll: impl FnMut(),
) -> Result<u64, PinnedError> {
    check_request(allocator, size)?;
    loop {
        let addr = allocator.lock().allocate(size);
        if let Some(addr) = addr {
            return Ok(addr);
        }
        poll();
        std::thread::yield_now();
    }
}
