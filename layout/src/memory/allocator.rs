//! First-Fit Segment Allocator
//!
//! Places component segments into a platform's regions using first-fit with
//! guard insertion. Each region starts as one free gap covering its whole
//! size; every placement cuts `align_up(size, alignment) + guard` bytes out
//! of the lowest-addressed gap that can hold them.
//!
//! # Algorithm
//!
//! 1. Reject malformed requests before touching any free-list
//! 2. Order requests by [`Priority`](super::Priority), keeping caller order among equals
//! 3. For each request, try the preferred region kind, then each fallback
//!    from the [`FallbackTable`] in declared order
//! 4. Within a kind, try regions lowest address first, skipping regions
//!    whose access rights or DMA reachability do not match
//! 5. Re-check the finished layout with [`verify_layout`]
//!
//! # Time Complexity
//!
//! - Per request: O(r * g) where r is the region count and g the gap count
//! - Whole batch: O(n^2) for ordering plus O(n * r * g) for placement
//!
//! All bounds are fixed capacities, so a call never runs unbounded.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::{
    AllocationError, AllocationRequest, ComponentId, FreeList, FreeListError, InvariantViolation,
    MAX_SEGMENTS, MemorySegment, RequestFault, SegmentTable, align_up, verify_layout,
};
use crate::platform::{MAX_REGIONS, MemoryRegion, PlatformProfile, RegionKind};

/// Guard bytes placed after every segment unless configured otherwise
pub const DEFAULT_GUARD_BYTES: u64 = 4096;

/// Maximum number of fallback rules
pub const MAX_FALLBACKS: usize = 8;

/// One "try `to` when `from` is exhausted" rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallbackRule {
    /// Region kind the request prefers
    pub from: RegionKind,
    /// Region kind tried next
    pub to: RegionKind,
}

/// Ordered fallback rules.
///
/// Fallback is a single hop: a request that falls back to `main` does not
/// follow `main`'s own rules. Rules for the same source are tried in the
/// order they were declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTable {
    rules: Vec<FallbackRule, MAX_FALLBACKS>,
    overflowed: bool,
}

impl Default for FallbackTable {
    fn default() -> Self {
        let mut table = Self::none();
        for from in [RegionKind::Scratchpad, RegionKind::Video, RegionKind::Audio] {
            // three rules always fit in MAX_FALLBACKS
            let _ = table.push(from, RegionKind::Main);
        }
        table
    }
}

impl FallbackTable {
    /// Table without any fallback
    pub const fn none() -> Self {
        Self { rules: Vec::new(), overflowed: false }
    }

    /// Append a rule; hands it back if the table is full
    pub fn push(&mut self, from: RegionKind, to: RegionKind) -> Result<(), FallbackRule> {
        self.rules.push(FallbackRule { from, to })
    }

    /// Builder form of [`push`](Self::push).
    ///
    /// A rule past capacity is dropped with a warning and marks the table
    /// as [`overflowed`](Self::overflowed), which config validation rejects.
    #[must_use]
    pub fn with(mut self, from: RegionKind, to: RegionKind) -> Self {
        if self.push(from, to).is_err() {
            debug_print!(WARN, "fallback table is full, dropping {} -> {}", from, to);
            self.overflowed = true;
        }
        self
    }

    /// Whether [`with`](Self::with) had to drop a rule
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Rules in declared order
    pub fn rules(&self) -> &[FallbackRule] {
        &self.rules
    }

    /// Region kinds to try for a request preferring `kind`, in order
    pub fn chain(&self, kind: RegionKind) -> impl Iterator<Item = RegionKind> + '_ {
        core::iter::once(kind).chain(self.rules.iter().filter(move |r| r.from == kind).map(|r| r.to))
    }
}

/// Segment allocator bound to one platform profile.
///
/// Holds configuration only. Free-lists are rebuilt for every
/// [`allocate`](Self::allocate) call, so one allocator (or one profile) can
/// serve any number of independent layouts, from any number of threads.
#[derive(Debug, Clone)]
pub struct SegmentAllocator<'p> {
    profile: &'p PlatformProfile,
    guard_bytes: u64,
    fallbacks: FallbackTable,
}

impl<'p> SegmentAllocator<'p> {
    /// Allocator with the default guard size and fallback rules
    pub fn new(profile: &'p PlatformProfile) -> Self {
        Self {
            profile,
            guard_bytes: DEFAULT_GUARD_BYTES,
            fallbacks: FallbackTable::default(),
        }
    }

    /// Set the guard size placed after every segment
    #[must_use]
    pub const fn with_guard_bytes(mut self, guard_bytes: u64) -> Self {
        self.guard_bytes = guard_bytes;
        self
    }

    /// Replace the fallback rules
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: FallbackTable) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Profile this allocator places into
    pub const fn profile(&self) -> &'p PlatformProfile {
        self.profile
    }

    /// Place every request, or none of them.
    ///
    /// Identical `(profile, requests)` in identical order always give
    /// identical placements.
    pub fn allocate(&self, requests: &[AllocationRequest]) -> Result<SegmentTable, AllocationError> {
        if requests.len() > MAX_SEGMENTS {
            return Err(AllocationError::TooManySegments);
        }
        check_requests(requests)?;

        let mut free: Vec<FreeList, MAX_REGIONS> = Vec::new();
        for region in self.profile.regions() {
            let list = FreeList::new(region.base, region.size).map_err(|_| AllocationError::Fragmented(region.kind))?;
            free.push(list).map_err(|_| AllocationError::Fragmented(region.kind))?;
        }

        let mut table = SegmentTable::new();
        for request in placement_order(requests) {
            let segment = self.place(request, &mut free)?;
            debug_print!(
                DEBUG,
                "placed {} in {} at {:#x}+{:#x} (guard {:#x})",
                segment.owner,
                segment.region,
                segment.base,
                segment.size,
                segment.guard
            );
            table.push(segment)?;
        }

        if let Err(violation) = verify_layout(self.profile, table.as_slice()) {
            return Err(invariant_failure(violation));
        }
        debug_print!(
            INFO,
            "{} segment(s) placed on {}, footprint ends at {:#x}",
            table.len(),
            self.profile.id(),
            table.footprint_end()
        );
        Ok(table)
    }

    fn place(&self, request: &AllocationRequest, free: &mut [FreeList]) -> Result<MemorySegment, AllocationError> {
        let component = request.component;
        let alignment = match request.alignment {
            0 => self.profile.default_alignment(),
            align => align,
        };
        let size = align_up(request.size, alignment).ok_or(AllocationError::AddressOverflow { component })?;
        let footprint = size
            .checked_add(self.guard_bytes)
            .ok_or(AllocationError::AddressOverflow { component })?;

        let mut shortfall: Option<u64> = None;
        for kind in self.fallbacks.chain(request.region) {
            let candidates = self
                .profile
                .regions()
                .iter()
                .zip(free.iter_mut())
                .filter(|(region, _)| region.kind == kind && accepts(region, request));

            for (region, list) in candidates {
                let Some(base) = list
                    .first_fit(size, alignment, self.guard_bytes)
                    .map_err(|e| free_list_error(component, kind, e))?
                else {
                    let deficit = list.deficit(size, alignment, self.guard_bytes);
                    shortfall = Some(shortfall.map_or(deficit, |s| s.min(deficit)));
                    continue;
                };

                list.reserve(base, footprint).map_err(|e| free_list_error(component, kind, e))?;
                if kind != request.region {
                    debug_print!(INFO, "{} fell back from {} to {} memory", component, request.region, kind);
                }
                return Ok(MemorySegment {
                    owner: component,
                    base,
                    size,
                    guard: self.guard_bytes,
                    alignment,
                    region: region.kind,
                    access: request.access,
                });
            }
        }

        let shortfall = shortfall.unwrap_or(footprint);
        debug_print!(
            WARN,
            "no {} gap for {}: {} bytes requested, short by {}",
            request.region,
            component,
            request.size,
            shortfall
        );
        Err(AllocationError::InsufficientMemory {
            component,
            region: request.region,
            requested: request.size,
            shortfall,
        })
    }
}

/// Place `requests` on `profile` with the default fallback rules
pub fn allocate(
    profile: &PlatformProfile,
    requests: &[AllocationRequest],
    guard_bytes: u64,
) -> Result<SegmentTable, AllocationError> {
    SegmentAllocator::new(profile).with_guard_bytes(guard_bytes).allocate(requests)
}

fn check_requests(requests: &[AllocationRequest]) -> Result<(), AllocationError> {
    for (i, request) in requests.iter().enumerate() {
        let component = request.component;
        let fault = if request.size == 0 {
            Some(RequestFault::ZeroSize)
        } else if request.alignment != 0 && !request.alignment.is_power_of_two() {
            Some(RequestFault::Alignment(request.alignment))
        } else if requests.iter().take(i).any(|r| r.component == component) {
            Some(RequestFault::Duplicate)
        } else {
            None
        };
        if let Some(fault) = fault {
            return Err(AllocationError::InvalidRequest { component, fault });
        }
    }
    Ok(())
}

/// Requests sorted by priority; stable, so caller order breaks ties
fn placement_order(requests: &[AllocationRequest]) -> Vec<&AllocationRequest, MAX_SEGMENTS> {
    let mut ordered: Vec<&AllocationRequest, MAX_SEGMENTS> = Vec::new();
    for request in requests {
        let at = ordered
            .iter()
            .position(|r| r.priority > request.priority)
            .unwrap_or(ordered.len());
        // capacity was checked against MAX_SEGMENTS by the caller
        let _ = ordered.insert(at, request);
    }
    ordered
}

fn accepts(region: &MemoryRegion, request: &AllocationRequest) -> bool {
    region.access.contains(request.access) && (!request.dma || region.is_dma_accessible())
}

fn free_list_error(component: ComponentId, kind: RegionKind, err: FreeListError) -> AllocationError {
    match err {
        FreeListError::Overflow => AllocationError::AddressOverflow { component },
        FreeListError::Full | FreeListError::NotFree { .. } | FreeListError::DoubleFree { .. } => {
            AllocationError::Fragmented(kind)
        }
    }
}

#[allow(clippy::panic)]
fn invariant_failure(violation: InvariantViolation) -> AllocationError {
    debug_print!(ERROR, "allocator produced a broken layout: {}", violation);
    if cfg!(debug_assertions) {
        panic!("segment allocator broke its post-condition: {violation}");
    }
    AllocationError::InternalInvariantViolation(violation)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use proptest::prelude::*;

    use super::*;
    use crate::memory::Priority;
    use crate::platform::{AccessFlags, resolve};

    const KB: u64 = 1024;

    fn request(id: u32, size: u64) -> AllocationRequest {
        AllocationRequest::new(ComponentId::new(id), size).with_alignment(16)
    }

    #[test]
    fn three_components_fit_in_two_megabytes() {
        let profile = resolve("handheld-2m").unwrap();
        let table = allocate(&profile, &[request(1, 1024 * KB), request(2, 512 * KB), request(3, 256 * KB)], 4096)
            .unwrap();

        let bases: std::vec::Vec<u64> = table.iter().map(|s| s.base).collect();
        assert_eq!(bases, [0x0, 0x10_1000, 0x18_2000]);
        assert!(table.iter().all(|s| s.guard_end() <= 2 * 1024 * KB));
    }

    #[test]
    fn fourth_request_reports_shortfall() {
        let profile = resolve("handheld-2m").unwrap();
        let requests = [request(1, 1024 * KB), request(2, 512 * KB), request(3, 256 * KB), request(4, 512 * KB)];
        assert_eq!(
            allocate(&profile, &requests, 4096),
            Err(AllocationError::InsufficientMemory {
                component: ComponentId::new(4),
                region: RegionKind::Main,
                requested: 512 * KB,
                shortfall: 0x4_4000,
            })
        );
    }

    #[test]
    fn higher_priority_is_placed_first() {
        let profile = resolve("handheld-2m").unwrap();
        let requests = [
            request(1, 64 * KB),
            request(2, 64 * KB).with_priority(Priority::RealTimeCritical),
            request(3, 64 * KB),
        ];
        let table = allocate(&profile, &requests, 0).unwrap();
        let owners: std::vec::Vec<u32> = table.iter().map(|s| s.owner.as_u32()).collect();
        assert_eq!(owners, [2, 1, 3]);
        assert_eq!(table.segment_for(ComponentId::new(2)).unwrap().base, 0);
    }

    #[test]
    fn zero_alignment_uses_profile_default() {
        let profile = resolve("dreamcast").unwrap();
        let requests = [
            AllocationRequest::new(ComponentId::new(1), 10),
            AllocationRequest::new(ComponentId::new(2), 10),
        ];
        let table = allocate(&profile, &requests, 0).unwrap();
        assert_eq!(table.segment_for(ComponentId::new(1)).unwrap().size, 32);
        assert_eq!(table.segment_for(ComponentId::new(2)).unwrap().base, 32);
    }

    #[test]
    fn scratchpad_falls_back_to_main() {
        let profile = resolve("handheld-2m").unwrap();
        let requests = [
            request(1, 12 * KB).in_region(RegionKind::Scratchpad),
            request(2, 12 * KB).in_region(RegionKind::Scratchpad),
        ];
        let table = allocate(&profile, &requests, 0).unwrap();
        assert_eq!(table.segment_for(ComponentId::new(1)).unwrap().region, RegionKind::Scratchpad);
        let fallen = table.segment_for(ComponentId::new(2)).unwrap();
        assert_eq!(fallen.region, RegionKind::Main);
        assert_eq!(fallen.base, 0);
    }

    #[test]
    fn empty_fallback_table_disables_fallback() {
        let profile = resolve("handheld-2m").unwrap();
        let result = SegmentAllocator::new(&profile)
            .with_guard_bytes(0)
            .with_fallbacks(FallbackTable::none())
            .allocate(&[request(1, 32 * KB).in_region(RegionKind::Scratchpad)]);
        assert_eq!(
            result,
            Err(AllocationError::InsufficientMemory {
                component: ComponentId::new(1),
                region: RegionKind::Scratchpad,
                requested: 32 * KB,
                shortfall: 16 * KB,
            })
        );
    }

    #[test]
    fn dma_request_skips_regions_without_dma() {
        let profile = resolve("web").unwrap();
        let err = allocate(&profile, &[request(1, KB).requires_dma()], 0).unwrap_err();
        assert!(matches!(err, AllocationError::InsufficientMemory { shortfall: 1024, .. }));

        let handheld = resolve("handheld-2m").unwrap();
        let table = allocate(&handheld, &[request(1, KB).requires_dma().in_region(RegionKind::Video)], 0).unwrap();
        assert_eq!(table.as_slice()[0].base, 0x20_0000);
    }

    #[test]
    fn execute_access_needs_an_executable_region() {
        let profile = resolve("handheld-2m").unwrap();
        let err = allocate(&profile, &[request(1, KB).with_access(AccessFlags::EXECUTE)], 0).unwrap_err();
        assert!(matches!(err, AllocationError::InsufficientMemory { .. }));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let profile = resolve("handheld-2m").unwrap();
        let id = ComponentId::new(1);
        assert_eq!(
            allocate(&profile, &[request(1, 0)], 0),
            Err(AllocationError::InvalidRequest { component: id, fault: RequestFault::ZeroSize })
        );
        assert_eq!(
            allocate(&profile, &[request(1, 8).with_alignment(24)], 0),
            Err(AllocationError::InvalidRequest { component: id, fault: RequestFault::Alignment(24) })
        );
        assert_eq!(
            allocate(&profile, &[request(1, 8), request(1, 8)], 0),
            Err(AllocationError::InvalidRequest { component: id, fault: RequestFault::Duplicate })
        );
    }

    #[test]
    fn wrapping_size_is_an_overflow() {
        let profile = resolve("desktop").unwrap();
        assert_eq!(
            allocate(&profile, &[request(1, u64::MAX - 4)], 0),
            Err(AllocationError::AddressOverflow { component: ComponentId::new(1) })
        );
        assert_eq!(
            allocate(&profile, &[request(1, u64::MAX - 64)], 4096),
            Err(AllocationError::AddressOverflow { component: ComponentId::new(1) })
        );
    }

    #[test]
    fn fallback_chain_is_single_hop() {
        let table = FallbackTable::none()
            .with(RegionKind::Scratchpad, RegionKind::Video)
            .with(RegionKind::Video, RegionKind::Main);
        let chain: std::vec::Vec<RegionKind> = table.chain(RegionKind::Scratchpad).collect();
        assert_eq!(chain, [RegionKind::Scratchpad, RegionKind::Video]);
    }

    #[test]
    fn full_table_of_page_aligned_segments_fits() {
        let profile = resolve("handheld-2m").unwrap();
        let requests: std::vec::Vec<AllocationRequest> = (0..MAX_SEGMENTS as u32)
            .map(|id| AllocationRequest::new(ComponentId::new(id), 16).with_alignment(4096))
            .collect();
        let table = allocate(&profile, &requests, 16).unwrap();
        assert_eq!(table.len(), MAX_SEGMENTS);
        for (i, segment) in table.iter().enumerate() {
            // 16 bytes round up to a 4KiB data range, then the guard pushes
            // the next base to the following page
            assert_eq!(segment.base, i as u64 * 8192);
        }

        let psp = resolve("psp").unwrap();
        let requests: std::vec::Vec<AllocationRequest> = (0..MAX_SEGMENTS as u32)
            .map(|id| AllocationRequest::new(ComponentId::new(id), 4 * KB).with_alignment(64 * KB))
            .collect();
        let table = allocate(&psp, &requests, DEFAULT_GUARD_BYTES).unwrap();
        assert_eq!(table.segment_for(ComponentId::new(127)).unwrap().base, 127 * 128 * KB);
    }

    #[test]
    fn overfull_fallback_table_is_flagged() {
        let mut table = FallbackTable::none();
        for _ in 0..MAX_FALLBACKS {
            table = table.with(RegionKind::Video, RegionKind::Main);
        }
        assert!(!table.overflowed());
        let table = table.with(RegionKind::Audio, RegionKind::Main);
        assert!(table.overflowed());
        assert_eq!(table.rules().len(), MAX_FALLBACKS);
        assert!(!table.chain(RegionKind::Audio).any(|k| k == RegionKind::Main));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "segment allocator broke its post-condition")]
    fn broken_post_condition_panics_in_debug() {
        let violation = InvariantViolation::Overlap { first: ComponentId::new(1), second: ComponentId::new(2) };
        let _ = invariant_failure(violation);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn broken_post_condition_is_an_internal_error_in_release() {
        let violation = InvariantViolation::Wraps { component: ComponentId::new(1) };
        let err = crate::LayoutError::from(invariant_failure(violation));
        assert_eq!(err, crate::LayoutError::Allocation(AllocationError::InternalInvariantViolation(violation)));
        assert!(err.is_internal());
        assert!(!err.is_recoverable());
    }

    fn arb_requests() -> impl Strategy<Value = std::vec::Vec<AllocationRequest>> {
        prop::collection::vec(
            (1u64..64 * KB, prop::sample::select(vec![0u64, 1, 16, 256, 4096]), 0u8..6),
            1..24,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (size, align, prio))| {
                    let priority = match prio {
                        0 => Priority::RealTimeCritical,
                        1 => Priority::RealTimeHigh,
                        2 => Priority::Normal,
                        3 => Priority::Low,
                        _ => Priority::Background,
                    };
                    AllocationRequest::new(ComponentId::new(i as u32), size)
                        .with_alignment(align)
                        .with_priority(priority)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn accepted_layouts_never_overlap(requests in arb_requests(), guard in 0u64..8192) {
            let profile = resolve("handheld-2m").unwrap();
            if let Ok(table) = allocate(&profile, &requests, guard) {
                let segments = table.as_slice();
                for (i, a) in segments.iter().enumerate() {
                    for b in &segments[i + 1..] {
                        prop_assert!(!a.footprint_overlaps(b), "{:?} overlaps {:?}", a, b);
                    }
                }
            }
        }

        #[test]
        fn allocation_is_deterministic(requests in arb_requests()) {
            let profile = resolve("psp").unwrap();
            prop_assert_eq!(allocate(&profile, &requests, 4096), allocate(&profile, &requests, 4096));
        }

        #[test]
        fn bases_honour_requested_alignment(requests in arb_requests()) {
            let profile = resolve("vita").unwrap();
            let table = allocate(&profile, &requests, 4096).unwrap();
            for request in &requests {
                let segment = table.segment_for(request.component).unwrap();
                let align = if request.alignment == 0 { profile.default_alignment() } else { request.alignment };
                prop_assert_eq!(segment.base % align, 0);
                prop_assert!(segment.size >= request.size);
            }
        }
    }
}
