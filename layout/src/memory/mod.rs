//! Memory Segment Management
//!
//! This module turns per-component memory requests into disjoint, guarded
//! segments of a platform's regions. It is made of:
//!
//! - Per-region free-lists of `(start, len)` gaps ([`free_list`])
//! - A first-fit segment allocator with guard insertion ([`allocator`])
//! - The layout post-condition checker ([`invariants`])
//! - Per-region byte accounting of a finished layout ([`stats`])
//!
//! # Design Principles
//!
//! - Segments live in an arena ([`SegmentTable`]) and are named by integer
//!   handles, never by pointers
//! - The allocator keeps no state between calls; every call works on its
//!   own copy of the free-lists
//! - Identical inputs produce byte-identical placements
//!
//! # Segment Layout
//!
//! ```text
//! base                      base + size        base + size + guard
//! │ data (component memory) │ guard (traps)    │ next segment...
//! └─────────────────────────┴──────────────────┘
//! ```

#![deny(missing_docs)]

use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::{assert_impl_all, const_assert};

use crate::platform::{AccessFlags, RegionKind, WASM_PAGE_SIZE};

pub mod allocator;
pub mod free_list;
pub mod invariants;
pub mod stats;

pub use allocator::{DEFAULT_GUARD_BYTES, FallbackRule, FallbackTable, MAX_FALLBACKS, SegmentAllocator, allocate};
pub use free_list::{FreeList, FreeListError, Gap};
pub use invariants::{InvariantViolation, verify_layout};
pub use stats::{LayoutStats, PoolUsage, RegionUsage};

/// Maximum number of segments in one layout
pub const MAX_SEGMENTS: usize = 128;

const_assert!(MAX_SEGMENTS <= u16::MAX as usize);
assert_impl_all!(SegmentTable: Send, Sync);

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit in 64 bits.
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Component identifier, as assigned by the flattener
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(u32);

impl ComponentId {
    /// Synthetic owner of the shared-memory pool segment
    pub const SHARED_POOL: Self = Self(u32::MAX);

    /// Create a new component ID
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::SHARED_POOL {
            f.write_str("shared-pool")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Placement priority; higher priorities are placed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Components whose failure blocks the whole system
    RealTimeCritical = 0,
    /// Real-time high priority
    RealTimeHigh = 1,
    /// Real-time normal priority
    RealTimeNormal = 2,
    /// Normal priority
    #[default]
    Normal = 3,
    /// Low priority
    Low = 4,
    /// Background priority
    Background = 5,
}

/// One component's memory request, as produced by the flattener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Requesting component
    pub component: ComponentId,
    /// Bytes of linear memory the component needs
    pub size: u64,
    /// Required base alignment; 0 selects the profile default
    pub alignment: u64,
    /// Access the component needs
    pub access: AccessFlags,
    /// Segment must be reachable by DMA
    pub dma: bool,
    /// Preferred region kind
    pub region: RegionKind,
    /// Placement priority
    pub priority: Priority,
}

impl AllocationRequest {
    /// Read-write request in main memory with default alignment and priority
    pub const fn new(component: ComponentId, size: u64) -> Self {
        Self {
            component,
            size,
            alignment: 0,
            access: AccessFlags::RW,
            dma: false,
            region: RegionKind::Main,
            priority: Priority::Normal,
        }
    }

    /// Require a base alignment
    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Require specific access rights
    #[must_use]
    pub const fn with_access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    /// Require DMA reachability
    #[must_use]
    pub const fn requires_dma(mut self) -> Self {
        self.dma = true;
        self
    }

    /// Prefer a region kind
    #[must_use]
    pub const fn in_region(mut self, region: RegionKind) -> Self {
        self.region = region;
        self
    }

    /// Set placement priority
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A contiguous, exclusively-owned byte range followed by a guard range.
///
/// Never edited after creation; a new layout produces new segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorySegment {
    /// Owning component
    pub owner: ComponentId,
    /// First byte of the data range
    pub base: u64,
    /// Size of the data range
    pub size: u64,
    /// Size of the guard range directly after the data
    pub guard: u64,
    /// Alignment the base satisfies
    pub alignment: u64,
    /// Kind of region the segment was carved from
    pub region: RegionKind,
    /// Access rights granted to the owner
    pub access: AccessFlags,
}

impl MemorySegment {
    /// One past the last data byte, saturating at the top of the address space
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// One past the last guard byte, saturating at the top of the address space
    pub const fn guard_end(&self) -> u64 {
        self.end().saturating_add(self.guard)
    }

    /// Whether `[addr, addr + len)` lies inside the data range
    pub const fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Whether the data-plus-guard footprints of two segments intersect
    pub const fn footprint_overlaps(&self, other: &Self) -> bool {
        self.base < other.guard_end() && other.base < self.guard_end()
    }
}

/// Index of a segment inside a [`SegmentTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentHandle(u16);

impl SegmentHandle {
    /// Raw index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena of the segments of one layout, in placement order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentTable {
    segments: Vec<MemorySegment, MAX_SEGMENTS>,
}

impl SegmentTable {
    /// Empty table
    pub const fn new() -> Self {
        Self { segments: Vec::new() }
    }

    pub(crate) fn push(&mut self, segment: MemorySegment) -> Result<SegmentHandle, AllocationError> {
        let handle = SegmentHandle(self.segments.len() as u16);
        self.segments
            .push(segment)
            .map_err(|_| AllocationError::TooManySegments)?;
        Ok(handle)
    }

    /// Segment behind a handle
    pub fn get(&self, handle: SegmentHandle) -> Option<&MemorySegment> {
        self.segments.get(handle.index())
    }

    /// Segment owned by a component
    pub fn find(&self, component: ComponentId) -> Option<(SegmentHandle, &MemorySegment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.owner == component)
            .map(|(i, s)| (SegmentHandle(i as u16), s))
    }

    /// Segment owned by a component, without its handle
    pub fn segment_for(&self, component: ComponentId) -> Option<&MemorySegment> {
        self.find(component).map(|(_, s)| s)
    }

    /// All segments, in placement order
    pub fn as_slice(&self) -> &[MemorySegment] {
        &self.segments
    }

    /// Iterate over segments
    pub fn iter(&self) -> impl Iterator<Item = &MemorySegment> {
        self.segments.iter()
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Highest guard end over all segments
    pub fn footprint_end(&self) -> u64 {
        self.segments.iter().map(MemorySegment::guard_end).max().unwrap_or(0)
    }

    /// 64KiB pages the merged linear memory must declare
    pub fn memory_pages(&self) -> u64 {
        self.footprint_end().div_ceil(WASM_PAGE_SIZE)
    }
}

/// Why a request was refused before placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestFault {
    /// Size is zero
    #[error("size is zero")]
    ZeroSize,
    /// Alignment is not a power of two
    #[error("alignment {0} is not a power of two")]
    Alignment(u64),
    /// The component already has a request in this batch
    #[error("component already has a segment")]
    Duplicate,
}

/// Memory allocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Request is malformed
    #[error("invalid request from {component}: {fault}")]
    InvalidRequest {
        /// Requesting component
        component: ComponentId,
        /// What is wrong with it
        fault: RequestFault,
    },
    /// No candidate region has a large-enough gap
    #[error("insufficient {region} memory for {component}: requested {requested} bytes, short by {shortfall} bytes")]
    InsufficientMemory {
        /// Requesting component
        component: ComponentId,
        /// Preferred region kind
        region: RegionKind,
        /// Requested data bytes
        requested: u64,
        /// Bytes missing from the closest-fitting gap
        shortfall: u64,
    },
    /// Placement arithmetic would wrap the address space
    #[error("address overflow placing {component}")]
    AddressOverflow {
        /// Requesting component
        component: ComponentId,
    },
    /// More segments than a layout can hold
    #[error("more than {} segments in one layout", MAX_SEGMENTS)]
    TooManySegments,
    /// A region's free-list ran out of slots
    #[error("{0} region is too fragmented")]
    Fragmented(RegionKind),
    /// The allocator broke its own post-condition
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(InvariantViolation),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn segment(owner: u32, base: u64, size: u64, guard: u64) -> MemorySegment {
        MemorySegment {
            owner: ComponentId::new(owner),
            base,
            size,
            guard,
            alignment: 16,
            region: RegionKind::Main,
            access: AccessFlags::RW,
        }
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 16), None);
    }

    #[test]
    fn guard_counts_toward_overlap() {
        let a = segment(1, 0, 0x1000, 0x1000);
        let touching = segment(2, 0x1000, 0x1000, 0);
        let after_guard = segment(3, 0x2000, 0x1000, 0);
        assert!(a.footprint_overlaps(&touching));
        assert!(!a.footprint_overlaps(&after_guard));
    }

    #[test]
    fn contains_rejects_wrapping_ranges() {
        let s = segment(1, 0x1000, 0x1000, 0);
        assert!(s.contains(0x1000, 0x1000));
        assert!(!s.contains(0x1ffc, 8));
        assert!(!s.contains(u64::MAX, 2));
    }

    #[test]
    fn ends_saturate_near_the_top_of_memory() {
        let high = segment(1, u64::MAX - 0x100, 0x1000, 0x1000);
        assert_eq!(high.end(), u64::MAX);
        assert_eq!(high.guard_end(), u64::MAX);
        assert!(!high.contains(u64::MAX - 8, 16));
        assert!(high.contains(u64::MAX - 0x100, 0x10));

        let low = segment(2, 0x1000, 0x1000, 0);
        assert!(!high.footprint_overlaps(&low));
        assert!(high.footprint_overlaps(&segment(3, u64::MAX - 0x10, 0x8, 0)));
    }

    #[test]
    fn table_pages_cover_the_footprint() {
        let mut table = SegmentTable::new();
        table.push(segment(1, 0, 0x10000, 0x1000)).unwrap();
        assert_eq!(table.footprint_end(), 0x11000);
        assert_eq!(table.memory_pages(), 2);
        assert_eq!(table.find(ComponentId::new(1)).unwrap().0.index(), 0);
        assert!(table.segment_for(ComponentId::new(9)).is_none());
    }

    #[test]
    fn shared_pool_id_displays_by_name() {
        assert_eq!(alloc::format!("{}", ComponentId::SHARED_POOL), "shared-pool");
        assert_eq!(alloc::format!("{}", ComponentId::new(7)), "#7");
    }
}
