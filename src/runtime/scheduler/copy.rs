//! Copy descriptors
//!
//! A `CopyData` describes one task argument that needs coherence: where it
//! lives locally, how it is shaped, and which host region it corresponds to.
//! Its dimensions are not owned by the copy. They are a range into the
//! `DimensionTable` that travels with the task, so that the whole set can be
//! shipped as plain values.

use std::ops::Range;

use crate::runtime::directory::RegionKey;

/// One dimension of a region: `{size, accessed length, lower bound}`.
///
/// The first dimension is measured in bytes, the others in elements of the
/// previous dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionDimension {
    pub size: u64,
    pub accessed_length: u64,
    pub lower_bound: u64,
}

impl RegionDimension {
    /// A dimension accessed in full.
    pub fn whole(size: u64) -> Self {
        Self {
            size,
            accessed_length: size,
            lower_bound: 0,
        }
    }
}

/// Access mode of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyFlags {
    pub input: bool,
    pub output: bool,
    pub can_rename: bool,
}

impl CopyFlags {
    pub const IN: CopyFlags = CopyFlags {
        input: true,
        output: false,
        can_rename: false,
    };
    pub const OUT: CopyFlags = CopyFlags {
        input: false,
        output: true,
        can_rename: false,
    };
    pub const INOUT: CopyFlags = CopyFlags {
        input: true,
        output: true,
        can_rename: false,
    };

    /// Pack into the low three bits of a byte.
    pub fn bits(&self) -> u8 {
        (self.input as u8) | (self.output as u8) << 1 | (self.can_rename as u8) << 2
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            input: bits & 1 != 0,
            output: bits & 2 != 0,
            can_rename: bits & 4 != 0,
        }
    }
}

/// Range of dimensions owned by a copy inside a `DimensionTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DimRange {
    pub offset: u32,
    pub count: u32,
}

impl DimRange {
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.count) as usize
    }
}

/// Dimensions of every copy of one task, stored back to back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DimensionTable(Vec<RegionDimension>);

impl DimensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the dimensions of one copy and return their range.
    pub fn push(
        &mut self,
        dims: &[RegionDimension],
    ) -> DimRange {
        let range = DimRange {
            offset: self.0.len() as u32,
            count: dims.len() as u32,
        };
        self.0.extend_from_slice(dims);
        range
    }

    /// Dimensions in `range`, or `None` if it points outside the table.
    pub fn get(
        &self,
        range: DimRange,
    ) -> Option<&[RegionDimension]> {
        self.0.get(range.range())
    }

    #[inline]
    pub fn as_slice(&self) -> &[RegionDimension] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<RegionDimension>> for DimensionTable {
    fn from(dims: Vec<RegionDimension>) -> Self {
        Self(dims)
    }
}

/// One coherent task argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyData {
    /// Address of the data on the executing node
    pub address: u64,
    pub flags: CopyFlags,
    pub dims: DimRange,
    /// Host base address of the data
    pub host_base_address: u64,
    /// Host region id
    pub host_region_id: u64,
}

impl CopyData {
    /// Directory key of the region.
    #[inline]
    pub fn region(&self) -> RegionKey {
        RegionKey::new(self.host_base_address, self.host_region_id)
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.flags.input
    }

    #[inline]
    pub fn is_output(&self) -> bool {
        self.flags.output
    }

    /// Bytes accessed: the product of every dimension's accessed length.
    pub fn accessed_bytes(
        &self,
        table: &DimensionTable,
    ) -> u64 {
        table
            .get(self.dims)
            .map(|dims| dims.iter().map(|d| d.accessed_length).product())
            .unwrap_or(0)
    }
}

/// Builds the copy list and dimension table of a task together.
#[derive(Debug, Default)]
pub struct CopySet {
    copies: Vec<CopyData>,
    table: DimensionTable,
}

impl CopySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a copy at `address` for host region `(host_base_address, region_id)`.
    pub fn add(
        mut self,
        address: u64,
        flags: CopyFlags,
        dims: &[RegionDimension],
        host_base_address: u64,
        host_region_id: u64,
    ) -> Self {
        let dims = self.table.push(dims);
        self.copies.push(CopyData {
            address,
            flags,
            dims,
            host_base_address,
            host_region_id,
        });
        self
    }

    /// A one-dimensional copy of `len` bytes whose host identity is its own address.
    pub fn linear(
        self,
        address: u64,
        len: u64,
        flags: CopyFlags,
    ) -> Self {
        self.add(address, flags, &[RegionDimension::whole(len)], address, 0)
    }

    pub fn finish(self) -> (Vec<CopyData>, DimensionTable) {
        (self.copies, self.table)
    }
}
