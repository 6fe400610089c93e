//! Layout Statistics
//!
//! Byte accounting over a finished layout. Every region of the profile gets
//! a [`RegionUsage`] entry, used or not, in the profile's region order.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::SegmentTable;
use crate::platform::{MAX_REGIONS, PlatformProfile, RegionKind};

/// Bytes claimed from one region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionUsage {
    /// Region kind
    pub kind: RegionKind,
    /// First byte of the region
    pub base: u64,
    /// Region size
    pub size: u64,
    /// Data bytes of the segments placed here
    pub data: u64,
    /// Guard bytes of the segments placed here
    pub guard: u64,
    /// Number of segments placed here
    pub segments: usize,
}

impl RegionUsage {
    /// Data plus guard bytes
    pub const fn used(&self) -> u64 {
        self.data.saturating_add(self.guard)
    }

    /// Bytes not claimed by any segment, padding included
    pub const fn free(&self) -> u64 {
        self.size.saturating_sub(self.used())
    }
}

/// Bytes claimed from the shared pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Pool segment size
    pub size: u64,
    /// Bytes not carved into a region
    pub available: u64,
    /// Live shared regions
    pub regions: usize,
}

impl PoolUsage {
    /// Bytes carved into regions, headers and padding included
    pub const fn used(&self) -> u64 {
        self.size.saturating_sub(self.available)
    }
}

/// Byte accounting of a whole layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutStats {
    /// One entry per profile region
    pub regions: Vec<RegionUsage, MAX_REGIONS>,
    /// Placed segments, shared pool included
    pub segment_count: usize,
    /// Highest guard end over all segments
    pub footprint_end: u64,
    /// 64KiB pages the merged memory must declare
    pub memory_pages: u64,
    /// Shared pool usage, if the layout has a pool
    pub shared: Option<PoolUsage>,
}

impl LayoutStats {
    /// Usage of the first region of a kind
    pub fn region(&self, kind: RegionKind) -> Option<&RegionUsage> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    /// Bytes claimed over every region
    pub fn used(&self) -> u64 {
        self.regions.iter().fold(0, |total, r| total.saturating_add(r.used()))
    }

    /// Bytes left over every region
    pub fn free(&self) -> u64 {
        self.regions.iter().fold(0, |total, r| total.saturating_add(r.free()))
    }
}

impl SegmentTable {
    /// Byte accounting of the table against the regions of `profile`
    pub fn stats(&self, profile: &PlatformProfile) -> LayoutStats {
        let mut regions: Vec<RegionUsage, MAX_REGIONS> = Vec::new();
        for region in profile.regions() {
            let mut usage = RegionUsage {
                kind: region.kind,
                base: region.base,
                size: region.size,
                data: 0,
                guard: 0,
                segments: 0,
            };
            for segment in self.iter() {
                if segment.region == region.kind && region.contains_range(segment.base, segment.size) {
                    usage.data = usage.data.saturating_add(segment.size);
                    usage.guard = usage.guard.saturating_add(segment.guard);
                    usage.segments += 1;
                }
            }
            // a profile never holds more than MAX_REGIONS regions
            if regions.push(usage).is_err() {
                break;
            }
        }

        LayoutStats {
            regions,
            segment_count: self.len(),
            footprint_end: self.footprint_end(),
            memory_pages: self.memory_pages(),
            shared: None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::memory::{AllocationRequest, ComponentId, allocate};
    use crate::platform::resolve;

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    #[test]
    fn usage_is_counted_per_region() {
        let profile = resolve("handheld-2m").unwrap();
        let requests = [
            AllocationRequest::new(ComponentId::new(1), 64 * KB),
            AllocationRequest::new(ComponentId::new(2), 16 * KB),
            AllocationRequest::new(ComponentId::new(3), 32 * KB).in_region(RegionKind::Video),
        ];
        let table = allocate(&profile, &requests, 4 * KB).unwrap();
        let stats = table.stats(&profile);

        assert_eq!(stats.regions.len(), 3);
        assert_eq!(stats.segment_count, 3);

        let main = stats.region(RegionKind::Main).unwrap();
        assert_eq!((main.data, main.guard, main.segments), (80 * KB, 8 * KB, 2));
        assert_eq!(main.free(), 2 * MB - 88 * KB);

        let video = stats.region(RegionKind::Video).unwrap();
        assert_eq!(video.base, 0x20_0000);
        assert_eq!(video.used(), 36 * KB);
        assert_eq!(video.free(), MB - 36 * KB);

        let scratch = stats.region(RegionKind::Scratchpad).unwrap();
        assert_eq!((scratch.used(), scratch.free()), (0, 16 * KB));

        assert_eq!(stats.used(), 124 * KB);
        assert_eq!(stats.free(), 3 * MB + 16 * KB - 124 * KB);
        assert_eq!(stats.footprint_end, 0x20_0000 + 36 * KB);
        assert_eq!(stats.memory_pages, table.memory_pages());
        assert_eq!(stats.shared, None);
    }

    #[test]
    fn empty_table_leaves_every_region_free() {
        let profile = resolve("dreamcast").unwrap();
        let stats = SegmentTable::new().stats(&profile);
        assert_eq!(stats.used(), 0);
        assert_eq!(stats.free(), profile.regions().iter().map(|r| r.size).sum::<u64>());
        assert_eq!((stats.segment_count, stats.footprint_end, stats.memory_pages), (0, 0, 0));
    }
}
