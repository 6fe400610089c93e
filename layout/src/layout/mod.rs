//! Layout Pipeline
//!
//! Runs every stage for one merged module:
//!
//! ```text
//! resolve ─▶ allocate (+ shared pool) ─▶ shared regions ─▶ validate ─▶ rebase
//!                                                                        │
//!                                                              MergedLayout
//! ```
//!
//! The builder owns its inputs and [`LayoutBuilder::build`] takes `&self`,
//! so one builder may be built repeatedly and independent builders may run
//! on separate threads.

#![deny(missing_docs)]

use alloc::vec::Vec;

use static_assertions::assert_impl_all;

use crate::config::LayoutConfig;
use crate::memory::{
    AllocationError, AllocationRequest, ComponentId, InvariantViolation, LayoutStats, MemorySegment,
    SegmentAllocator, SegmentTable,
};
use crate::platform::{self, PlatformProfile};
use crate::rebase::{Instruction, RebasedComponent, Rebaser, RelocationTable};
use crate::safety::{AccessKind, BoundsCheck, BoundsCheckPolicy, ValidationReport, analyze};
use crate::shared::{SharedPool, SharedRegion, SharedRegionId, SharedRegionRequest, SharingError};
use crate::{LayoutError, LayoutResult};

assert_impl_all!(MergedLayout: Send, Sync);
assert_impl_all!(LayoutBuilder: Send, Sync);

/// A component handed in by the flattener
#[derive(Debug, Clone, PartialEq, Eq)]
struct ComponentInput {
    request: AllocationRequest,
    instructions: Vec<Instruction>,
}

/// Collects components and shared regions, then lays them out
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    profile: PlatformProfile,
    config: LayoutConfig,
    components: Vec<ComponentInput>,
    shared: Vec<SharedRegionRequest>,
}

impl LayoutBuilder {
    /// Builder over an already resolved profile
    pub const fn new(profile: PlatformProfile, config: LayoutConfig) -> Self {
        Self { profile, config, components: Vec::new(), shared: Vec::new() }
    }

    /// Builder for a built-in platform id
    pub fn for_platform(platform: &str, config: LayoutConfig) -> LayoutResult<Self> {
        Ok(Self::new(platform::resolve(platform)?, config))
    }

    /// Add a component with its memory instruction stream
    #[must_use]
    pub fn component(mut self, request: AllocationRequest, instructions: impl Into<Vec<Instruction>>) -> Self {
        self.components.push(ComponentInput { request, instructions: instructions.into() });
        self
    }

    /// Add a shared region
    #[must_use]
    pub fn share(mut self, request: SharedRegionRequest) -> Self {
        self.shared.push(request);
        self
    }

    /// Profile the layout targets
    pub const fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// Configuration in use
    pub const fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Run the whole pipeline
    pub fn build(&self) -> LayoutResult<MergedLayout> {
        self.config.validate()?;
        self.check_sharers()?;

        let budget = SharedPool::budget(&self.shared, self.profile.has_atomics())
            .ok_or(AllocationError::AddressOverflow { component: ComponentId::SHARED_POOL })?;
        let mut requests: Vec<AllocationRequest> = self.components.iter().map(|c| c.request).collect();
        if budget > 0 {
            requests.push(SharedPool::request(budget));
        }

        let segments = SegmentAllocator::new(&self.profile)
            .with_guard_bytes(self.config.guard_bytes)
            .with_fallbacks(self.config.fallbacks.clone())
            .allocate(&requests)?;

        let pool = if budget > 0 {
            let segment = placed(&segments, ComponentId::SHARED_POOL)?;
            let mut pool = SharedPool::new(*segment, &self.profile)?;
            for request in &self.shared {
                pool.create(request)?;
            }
            Some(pool)
        } else {
            None
        };

        let mut components = Vec::with_capacity(self.components.len());
        let mut reports = Vec::with_capacity(self.components.len());
        for input in &self.components {
            let component = input.request.component;
            let segment = placed(&segments, component)?;
            let pattern = analyze(&input.instructions, segment.size);
            let report = pattern.report();
            if !report.passed && self.config.inject_checks.is_none() {
                debug_print!(
                    WARN,
                    "{} rejected with {} unproven access(es)",
                    component,
                    report.violations.len()
                );
                return Err(LayoutError::ValidationFailed { component, violations: report.violations });
            }

            let mut rebaser = Rebaser::new(segment).emit_relocations(self.config.emit_relocations);
            if let Some(scratch) = self.config.inject_checks {
                rebaser = rebaser.inject_checks(scratch);
            }
            components.push(rebaser.rebase_with(&input.instructions, &pattern)?);
            reports.push((component, report));
        }

        debug_print!(
            INFO,
            "laid out {} component(s) and {} shared region(s) on {} ({} page(s))",
            components.len(),
            self.shared.len(),
            self.profile.id(),
            segments.memory_pages()
        );
        Ok(MergedLayout {
            profile: self.profile.clone(),
            segments,
            pool,
            components,
            reports,
            bounds_check: self.config.bounds_check,
        })
    }

    fn check_sharers(&self) -> Result<(), SharingError> {
        for request in &self.shared {
            if request.overflowed() {
                return Err(SharingError::TooManySharers);
            }
            for sharer in &request.sharers {
                if !self.components.iter().any(|c| c.request.component == sharer.component) {
                    return Err(SharingError::InvalidSharer(sharer.component));
                }
            }
        }
        Ok(())
    }
}

fn placed(segments: &SegmentTable, component: ComponentId) -> LayoutResult<&MemorySegment> {
    segments.segment_for(component).ok_or_else(|| {
        let violation = InvariantViolation::Missing { component };
        debug_print!(ERROR, "allocator dropped a request: {}", violation);
        LayoutError::Allocation(AllocationError::InternalInvariantViolation(violation))
    })
}

/// Everything the runtime needs to instantiate the merged module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedLayout {
    profile: PlatformProfile,
    segments: SegmentTable,
    pool: Option<SharedPool>,
    components: Vec<RebasedComponent>,
    reports: Vec<(ComponentId, ValidationReport)>,
    bounds_check: BoundsCheckPolicy,
}

impl MergedLayout {
    /// Profile the layout was built for
    pub const fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// Every placed segment, shared pool included
    pub const fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    /// Segment of one component
    pub fn segment_for(&self, component: ComponentId) -> Option<&MemorySegment> {
        self.segments.segment_for(component)
    }

    /// Shared pool, if any region was requested
    pub const fn pool(&self) -> Option<&SharedPool> {
        self.pool.as_ref()
    }

    /// Shared regions, in request order
    pub fn shared_regions(&self) -> &[SharedRegion] {
        match &self.pool {
            Some(pool) => pool.regions(),
            None => &[],
        }
    }

    /// Shared region by id
    pub fn shared_region(&self, id: SharedRegionId) -> Option<&SharedRegion> {
        self.pool.as_ref().and_then(|p| p.region(id))
    }

    /// Rebased components, in the order they were added
    pub fn components(&self) -> &[RebasedComponent] {
        &self.components
    }

    /// Rebased output of one component
    pub fn component(&self, component: ComponentId) -> Option<&RebasedComponent> {
        self.components.iter().find(|c| c.component == component)
    }

    /// Validation outcome of one component
    pub fn report(&self, component: ComponentId) -> Option<&ValidationReport> {
        self.reports.iter().find(|(c, _)| *c == component).map(|(_, r)| r)
    }

    /// Relocation tables for symbolication
    pub fn relocation_tables(&self) -> impl Iterator<Item = &RelocationTable> {
        self.components.iter().map(|c| &c.relocations)
    }

    /// 64KiB pages the merged memory must declare
    pub fn memory_pages(&self) -> u64 {
        self.segments.memory_pages()
    }

    /// Per-region byte accounting, shared pool included
    pub fn stats(&self) -> LayoutStats {
        let mut stats = self.segments.stats(&self.profile);
        stats.shared = self.pool.as_ref().map(SharedPool::usage);
        stats
    }

    /// Runtime bounds-check strategy of this layout
    pub const fn bounds_check(&self) -> BoundsCheckPolicy {
        self.bounds_check
    }

    /// Whether `component` may touch `[addr, addr + size)` of its own segment
    pub fn check_access(&self, component: ComponentId, addr: u64, size: u64) -> bool {
        self.segment_for(component)
            .is_some_and(|segment| self.bounds_check.check_access(addr, size, segment))
    }

    /// Whether `component` may perform `kind` on `[addr, addr + size)` of a
    /// shared region; unknown regions are refused
    pub fn check_shared_access(
        &self,
        region: SharedRegionId,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) -> bool {
        self.shared_region(region)
            .is_some_and(|r| self.bounds_check.check_shared_access(r, component, addr, size, kind))
    }

    /// Trap unless the shared access is permitted
    #[track_caller]
    pub fn enforce_shared_access(
        &self,
        region: SharedRegionId,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) -> Result<(), SharingError> {
        let shared = self.shared_region(region).ok_or(SharingError::UnknownRegion(region))?;
        self.bounds_check.enforce_shared_access(shared, component, addr, size, kind);
        Ok(())
    }
}
