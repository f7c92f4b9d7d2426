//! Pinned segment allocator
//!
//! `SimpleAllocator` hands out temporary transfer buffers from a fixed,
//! pre-registered segment. It keeps two maps keyed by start address:
//! free chunks and allocated chunks. Together they always partition the
//! segment exactly.
//!
//! # Design Principles
//! - First fit, in address order
//! - Returned addresses are aligned to the next power of two >= size
//! - Adjacent free chunks are merged on every `free`
//! - No internal locking: callers serialize access (see `PinnedSegments`)

use std::collections::BTreeMap;
use std::fmt;

/// Errors reported by `SimpleAllocator::free`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The address was never handed out, or was already freed.
    #[error("address {0:#x} is not an allocated chunk")]
    UnknownAddress(u64),
    /// The chunk being released overlaps a chunk that is already free.
    #[error("chunk {addr:#x}+{size} overlaps a free chunk")]
    Overlap { addr: u64, size: usize },
}

/// First-fit allocator over a fixed address range.
#[derive(Clone, Default)]
pub struct SimpleAllocator {
    /// Segment start
    base: u64,
    /// Segment length in bytes
    len: usize,
    /// Free chunks: start -> length
    free_chunks: BTreeMap<u64, usize>,
    /// Allocated chunks: start -> length
    allocated_chunks: BTreeMap<u64, usize>,
}

impl SimpleAllocator {
    /// Create an allocator managing `[base, base + len)`.
    pub fn new(
        base: u64,
        len: usize,
    ) -> Self {
        let mut allocator = Self::default();
        allocator.init(base, len);
        allocator
    }

    /// Reset the allocator to a single free chunk covering the segment.
    pub fn init(
        &mut self,
        base: u64,
        len: usize,
    ) {
        self.base = base;
        self.len = len;
        self.free_chunks.clear();
        self.allocated_chunks.clear();
        if len > 0 {
            self.free_chunks.insert(base, len);
        }
    }

    /// Segment start address.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Segment length.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Allocate `size` bytes.
    ///
    /// Returns `None` when no free chunk can hold an aligned span of `size`
    /// bytes. This never blocks: callers that need memory poll the network
    /// and try again.
    pub fn allocate(
        &mut self,
        size: usize,
    ) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = size.checked_next_power_of_two()? as u64;
        let size_u64 = size as u64;

        let mut found = None;
        for (&start, &chunk_len) in &self.free_chunks {
            let Some(aligned) = start.checked_next_multiple_of(align) else {
                continue;
            };
            let chunk_end = start + chunk_len as u64;
            if aligned
                .checked_add(size_u64)
                .is_some_and(|end| end <= chunk_end)
            {
                found = Some((start, chunk_end, aligned));
                break;
            }
        }

        let Some((start, chunk_end, aligned)) = found else {
            tracing::warn!(size, free = self.free_bytes(), "pinned allocator is full");
            self.dump();
            return None;
        };

        self.free_chunks.remove(&start);
        if aligned > start {
            self.free_chunks.insert(start, (aligned - start) as usize);
        }
        let end = aligned + size_u64;
        if end < chunk_end {
            self.free_chunks.insert(end, (chunk_end - end) as usize);
        }
        self.allocated_chunks.insert(aligned, size);

        Some(aligned)
    }

    /// Release the chunk starting at `addr`, returning its size.
    pub fn free(
        &mut self,
        addr: u64,
    ) -> Result<usize, AllocError> {
        let size = *self
            .allocated_chunks
            .get(&addr)
            .ok_or(AllocError::UnknownAddress(addr))?;
        let end = addr + size as u64;

        let prev = self
            .free_chunks
            .range(..=addr)
            .next_back()
            .map(|(&start, &len)| (start, len));
        let next = self
            .free_chunks
            .range(addr..)
            .next()
            .map(|(&start, &len)| (start, len));

        let overlaps_prev = prev.is_some_and(|(start, len)| start + len as u64 > addr);
        let overlaps_next = next.is_some_and(|(start, _)| start < end);
        if overlaps_prev || overlaps_next {
            tracing::error!(addr, size, "freed chunk overlaps a free chunk");
            return Err(AllocError::Overlap { addr, size });
        }

        self.allocated_chunks.remove(&addr);

        let mut merged_start = addr;
        let mut merged_len = size;
        if let Some((start, len)) = prev {
            if start + len as u64 == addr {
                self.free_chunks.remove(&start);
                merged_start = start;
                merged_len += len;
            }
        }
        if let Some((start, len)) = next {
            if start == end {
                self.free_chunks.remove(&start);
                merged_len += len;
            }
        }
        self.free_chunks.insert(merged_start, merged_len);

        Ok(size)
    }

    /// Iterate free chunks in address order.
    pub fn free_chunks(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.free_chunks.iter().map(|(&a, &l)| (a, l))
    }

    /// Iterate allocated chunks in address order.
    pub fn allocated_chunks(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.allocated_chunks.iter().map(|(&a, &l)| (a, l))
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> usize {
        self.free_chunks.values().sum()
    }

    /// Total allocated bytes.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_chunks.values().sum()
    }

    /// Whether the chunk at `addr` is currently allocated.
    #[inline]
    pub fn is_allocated(
        &self,
        addr: u64,
    ) -> bool {
        self.allocated_chunks.contains_key(&addr)
    }

    /// Log both chunk maps at debug level.
    pub fn dump(&self) {
        tracing::debug!(
            base = self.base,
            len = self.len,
            "pinned allocator map"
        );
        for (addr, len) in self.free_chunks() {
            tracing::debug!("  free  {:#x}..{:#x} ({} bytes)", addr, addr + len as u64, len);
        }
        for (addr, len) in self.allocated_chunks() {
            tracing::debug!("  alloc {:#x}..{:#x} ({} bytes)", addr, addr + len as u64, len);
        }
    }
}

impl fmt::Debug for SimpleAllocator {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SimpleAllocator")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .field("free_chunks", &self.free_chunks.len())
            .field("allocated_chunks", &self.allocated_chunks.len())
            .finish()
    }
}
