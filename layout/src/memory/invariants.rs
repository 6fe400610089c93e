//! Layout Post-Conditions
//!
//! Every layout handed out by the allocator must satisfy:
//!
//! 1. No two segment footprints (data plus guard) intersect
//! 2. Each guard range directly follows its data range
//! 3. Each base is a multiple of the segment's alignment
//! 4. Each data range lies inside a region of the segment's kind
//!
//! (2) holds by construction of [`MemorySegment`]; the others are checked
//! here. A failure means the allocator is broken, not that the caller asked
//! for something impossible.

use heapless::Vec;

use super::{ComponentId, MAX_SEGMENTS, MemorySegment};
use crate::platform::{PlatformProfile, RegionKind};

/// A broken layout post-condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Two footprints intersect
    #[error("segments of {first} and {second} overlap")]
    Overlap {
        /// Lower segment owner
        first: ComponentId,
        /// Higher segment owner
        second: ComponentId,
    },
    /// A base is not a multiple of its alignment
    #[error("segment of {component} at {base:#x} is not {alignment}-byte aligned")]
    Misaligned {
        /// Segment owner
        component: ComponentId,
        /// Segment base
        base: u64,
        /// Required alignment
        alignment: u64,
    },
    /// A data range leaves its region
    #[error("segment of {component} is outside every {region} region")]
    OutOfRegion {
        /// Segment owner
        component: ComponentId,
        /// Region kind the segment claims
        region: RegionKind,
    },
    /// Footprint arithmetic wraps
    #[error("segment of {component} wraps the address space")]
    Wraps {
        /// Segment owner
        component: ComponentId,
    },
    /// A shared region escapes the shared pool
    #[error("shared region {region} lies outside the shared pool")]
    SharedOutsidePool {
        /// Shared region index
        region: u16,
    },
    /// A request was accepted but no segment was placed for it
    #[error("no segment was placed for {component}")]
    Missing {
        /// Requesting component
        component: ComponentId,
    },
}

/// Check the post-conditions of a finished layout
pub fn verify_layout(profile: &PlatformProfile, segments: &[MemorySegment]) -> Result<(), InvariantViolation> {
    let mut sorted: Vec<&MemorySegment, MAX_SEGMENTS> = Vec::new();

    for segment in segments {
        let component = segment.owner;
        segment
            .base
            .checked_add(segment.size)
            .and_then(|end| end.checked_add(segment.guard))
            .ok_or(InvariantViolation::Wraps { component })?;

        if segment.alignment == 0 || segment.base % segment.alignment != 0 {
            return Err(InvariantViolation::Misaligned {
                component,
                base: segment.base,
                alignment: segment.alignment,
            });
        }

        if !profile
            .regions_of(segment.region)
            .any(|r| r.contains_range(segment.base, segment.size))
        {
            return Err(InvariantViolation::OutOfRegion { component, region: segment.region });
        }

        let at = sorted.iter().position(|s| s.base > segment.base).unwrap_or(sorted.len());
        // segments beyond MAX_SEGMENTS cannot come out of a SegmentTable
        if sorted.insert(at, segment).is_err() {
            break;
        }
    }

    for pair in sorted.windows(2) {
        if let [lower, upper] = pair {
            if lower.footprint_overlaps(upper) {
                return Err(InvariantViolation::Overlap { first: lower.owner, second: upper.owner });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::memory::{AllocationRequest, allocate};
    use crate::platform::{AccessFlags, resolve};

    fn segment(owner: u32, base: u64, size: u64) -> MemorySegment {
        MemorySegment {
            owner: ComponentId::new(owner),
            base,
            size,
            guard: 0x1000,
            alignment: 16,
            region: RegionKind::Main,
            access: AccessFlags::RW,
        }
    }

    #[test]
    fn disjoint_layout_passes() {
        let profile = resolve("handheld-2m").unwrap();
        let segments = [segment(1, 0, 0x1000), segment(2, 0x2000, 0x1000)];
        assert_eq!(verify_layout(&profile, &segments), Ok(()));
    }

    #[test]
    fn segment_in_neighbours_guard_is_caught() {
        let profile = resolve("handheld-2m").unwrap();
        let segments = [segment(2, 0x1800, 0x100), segment(1, 0, 0x1000)];
        assert_eq!(
            verify_layout(&profile, &segments),
            Err(InvariantViolation::Overlap { first: ComponentId::new(1), second: ComponentId::new(2) })
        );
    }

    #[test]
    fn misaligned_base_is_caught() {
        let profile = resolve("handheld-2m").unwrap();
        let segments = [segment(1, 0x1008, 0x100)];
        assert!(matches!(
            verify_layout(&profile, &segments),
            Err(InvariantViolation::Misaligned { base: 0x1008, .. })
        ));
    }

    #[test]
    fn segment_past_region_end_is_caught() {
        let profile = resolve("handheld-2m").unwrap();
        let segments = [segment(1, 0x1F_F000, 0x2000)];
        assert_eq!(
            verify_layout(&profile, &segments),
            Err(InvariantViolation::OutOfRegion { component: ComponentId::new(1), region: RegionKind::Main })
        );
    }

    #[test]
    fn corrupted_allocator_output_is_caught() {
        let profile = resolve("handheld-2m").unwrap();
        let requests = [
            AllocationRequest::new(ComponentId::new(1), 0x4000),
            AllocationRequest::new(ComponentId::new(2), 0x4000),
        ];
        let mut table = allocate(&profile, &requests, 0x1000).unwrap();
        assert_eq!(verify_layout(&profile, table.as_slice()), Ok(()));

        let second = *table.segment_for(ComponentId::new(2)).unwrap();
        table.push(MemorySegment { owner: ComponentId::new(3), base: second.base + 0x1000, ..second }).unwrap();
        assert_eq!(
            verify_layout(&profile, table.as_slice()),
            Err(InvariantViolation::Overlap { first: ComponentId::new(2), second: ComponentId::new(3) })
        );
    }

    #[test]
    fn wrapping_footprint_is_caught() {
        let profile = resolve("handheld-2m").unwrap();
        let segments = [segment(1, u64::MAX - 0xFFF, 0x800)];
        assert_eq!(
            verify_layout(&profile, &segments),
            Err(InvariantViolation::Wraps { component: ComponentId::new(1) })
        );
    }
}
