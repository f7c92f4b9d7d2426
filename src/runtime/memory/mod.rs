//! Node-local memory
//!
//! Every cluster node owns an `AddressSpace`: a set of mapped byte ranges
//! addressed by 64-bit addresses. Remote nodes never dereference these
//! addresses; they only ship them back in messages so that the owning node
//! can resolve them.
//!
//! The registered transport segment is mapped like any other range, and
//! `PinnedSegments` carves temporary transfer buffers out of it.

mod allocator;
mod pinned;

pub use allocator::{AllocError, SimpleAllocator};
pub use pinned::{PinnedError, PinnedSegments};

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Start of the heap used by `AddressSpace::allocate`.
pub const HEAP_BASE: u64 = 0x1000_0000;

/// Heap allocations are rounded up to this granularity.
pub const PAGE_SIZE: u64 = 4096;

/// Errors raised when touching node memory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("range {addr:#x}+{len} is not mapped")]
    Unmapped { addr: u64, len: usize },
    #[error("range {base:#x}+{len} overlaps an existing mapping")]
    Overlap { base: u64, len: usize },
    #[error("no mapping starts at {0:#x}")]
    NotAMapping(u64),
    #[error("fill word size {0} is not one of 1, 2, 4 or 8")]
    BadWordSize(usize),
    #[error("strided access with size {size} and leading dimension {ld} is invalid")]
    BadStride { size: usize, ld: usize },
    #[error("packed buffer holds {actual} bytes, {expected} needed")]
    ShortBuffer { expected: usize, actual: usize },
}

/// Mapped memory of one node.
#[derive(Debug)]
pub struct AddressSpace {
    /// Mappings: base -> bytes
    mappings: RwLock<BTreeMap<u64, Vec<u8>>>,
    /// Next heap address
    heap_next: parking_lot::Mutex<u64>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self {
            mappings: RwLock::new(BTreeMap::new()),
            heap_next: parking_lot::Mutex::new(HEAP_BASE),
        }
    }

    /// Map a zeroed range at a fixed address.
    pub fn map(
        &self,
        base: u64,
        len: usize,
    ) -> Result<(), MemoryError> {
        let mut mappings = self.mappings.write();
        let end = base + len as u64;
        let clashes = mappings
            .range(..end)
            .next_back()
            .is_some_and(|(&start, data)| start + data.len() as u64 > base);
        if clashes {
            return Err(MemoryError::Overlap { base, len });
        }
        mappings.insert(base, vec![0u8; len]);
        Ok(())
    }

    /// Allocate a zeroed range on the node heap.
    pub fn allocate(
        &self,
        len: usize,
    ) -> u64 {
        let mut next = self.heap_next.lock();
        let base = *next;
        let rounded = (len.max(1) as u64).next_multiple_of(PAGE_SIZE);
        *next += rounded;
        self.mappings.write().insert(base, vec![0u8; len]);
        base
    }

    /// Remove the mapping starting at `base`, returning its length.
    pub fn release(
        &self,
        base: u64,
    ) -> Result<usize, MemoryError> {
        self.mappings
            .write()
            .remove(&base)
            .map(|data| data.len())
            .ok_or(MemoryError::NotAMapping(base))
    }

    /// Whether `[addr, addr + len)` lies inside one mapping.
    pub fn is_mapped(
        &self,
        addr: u64,
        len: usize,
    ) -> bool {
        let mappings = self.mappings.read();
        Self::locate(&mappings, addr, len).is_ok()
    }

    fn locate(
        mappings: &BTreeMap<u64, Vec<u8>>,
        addr: u64,
        len: usize,
    ) -> Result<(u64, usize), MemoryError> {
        let (&base, data) = mappings
            .range(..=addr)
            .next_back()
            .ok_or(MemoryError::Unmapped { addr, len })?;
        let offset = (addr - base) as usize;
        if offset + len > data.len() {
            return Err(MemoryError::Unmapped { addr, len });
        }
        Ok((base, offset))
    }

    /// Copy `len` bytes starting at `addr`.
    pub fn read(
        &self,
        addr: u64,
        len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let mappings = self.mappings.read();
        let (base, offset) = Self::locate(&mappings, addr, len)?;
        Ok(mappings[&base][offset..offset + len].to_vec())
    }

    /// Write `bytes` at `addr`.
    pub fn write(
        &self,
        addr: u64,
        bytes: &[u8],
    ) -> Result<(), MemoryError> {
        let mut mappings = self.mappings.write();
        let (base, offset) = Self::locate(&mappings, addr, bytes.len())?;
        if let Some(data) = mappings.get_mut(&base) {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst` inside this address space.
    pub fn copy(
        &self,
        src: u64,
        dst: u64,
        len: usize,
    ) -> Result<(), MemoryError> {
        let bytes = self.read(src, len)?;
        self.write(dst, &bytes)
    }

    /// Fill `len` bytes at `addr` with `value`, repeated as a `word_size` word.
    ///
    /// A trailing partial word is left untouched.
    pub fn fill(
        &self,
        addr: u64,
        len: usize,
        word_size: usize,
        value: u64,
    ) -> Result<(), MemoryError> {
        if !matches!(word_size, 1 | 2 | 4 | 8) {
            return Err(MemoryError::BadWordSize(word_size));
        }
        let word = &value.to_le_bytes()[..word_size];
        let mut mappings = self.mappings.write();
        let (base, offset) = Self::locate(&mappings, addr, len)?;
        if let Some(data) = mappings.get_mut(&base) {
            for chunk in data[offset..offset + len].chunks_exact_mut(word_size) {
                chunk.copy_from_slice(word);
            }
        }
        Ok(())
    }

    /// Gather `count` elements of `size` bytes spaced `ld` bytes apart.
    pub fn read_strided(
        &self,
        addr: u64,
        size: usize,
        count: usize,
        ld: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let span = strided_span(size, count, ld)?;
        let view = self.read(addr, span)?;
        Ok(pack_strided(&view, size, count, ld))
    }

    /// Scatter packed elements to `addr` with leading dimension `ld`.
    pub fn write_strided(
        &self,
        addr: u64,
        packed: &[u8],
        size: usize,
        count: usize,
        ld: usize,
    ) -> Result<(), MemoryError> {
        let span = strided_span(size, count, ld)?;
        if packed.len() < size * count {
            return Err(MemoryError::ShortBuffer {
                expected: size * count,
                actual: packed.len(),
            });
        }
        let mut mappings = self.mappings.write();
        let (base, offset) = Self::locate(&mappings, addr, span)?;
        if let Some(data) = mappings.get_mut(&base) {
            unpack_strided(&mut data[offset..offset + span], packed, size, count, ld);
        }
        Ok(())
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes covered by a strided view: every row but the last spans `ld`.
pub fn strided_span(
    size: usize,
    count: usize,
    ld: usize,
) -> Result<usize, MemoryError> {
    if count == 0 {
        return Ok(0);
    }
    if count > 1 && ld < size {
        return Err(MemoryError::BadStride { size, ld });
    }
    Ok((count - 1) * ld + size)
}

/// Pack `count` rows of `size` bytes, `ld` bytes apart, into a contiguous buffer.
pub fn pack_strided(
    src: &[u8],
    size: usize,
    count: usize,
    ld: usize,
) -> Vec<u8> {
    let mut packed = Vec::with_capacity(size * count);
    for i in 0..count {
        packed.extend_from_slice(&src[i * ld..i * ld + size]);
    }
    packed
}

/// Inverse of `pack_strided`: `dst[i*ld..i*ld+size] = packed[i*size..i*size+size]`.
pub fn unpack_strided(
    dst: &mut [u8],
    packed: &[u8],
    size: usize,
    count: usize,
    ld: usize,
) {
    for i in 0..count {
        dst[i * ld..i * ld + size].copy_from_slice(&packed[i * size..i * size + size]);
    }
}

#[cfg(test)]
mod tests;
