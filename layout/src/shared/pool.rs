//! Shared Pool Allocator
//!
//! Carves shared regions out of the pool segment with the same first-fit
//! free-list the segment allocator uses. Released regions go back to the
//! free-list and coalesce with their neighbours.

use alloc::vec::Vec as AllocVec;

use heapless::Vec;

use super::{
    MAX_SHARERS, SHARED_ALIGNMENT, SYNC_HEADER_BYTES, SharedRegion, SharedRegionId, SharedRegionRequest, Sharer,
    SharingError, SyncHandle,
};
use crate::memory::{
    AllocationRequest, ComponentId, FreeList, InvariantViolation, MemorySegment, PoolUsage, align_up,
};
use crate::platform::{AccessFlags, PlatformProfile};

/// Pool segment plus the shared regions carved from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPool {
    segment: MemorySegment,
    free: FreeList,
    regions: AllocVec<SharedRegion>,
    atomics: bool,
    next_id: u16,
}

impl SharedPool {
    /// Pool bytes needed to hold every request at once, `None` on overflow
    pub fn budget(requests: &[SharedRegionRequest], has_atomics: bool) -> Option<u64> {
        requests
            .iter()
            .try_fold(0u64, |total, r| total.checked_add(region_footprint(r.size, has_atomics)?))
    }

    /// Allocation request for a pool of `budget` bytes
    pub const fn request(budget: u64) -> AllocationRequest {
        AllocationRequest::new(ComponentId::SHARED_POOL, budget).with_alignment(SHARED_ALIGNMENT)
    }

    /// Pool over a segment owned by [`ComponentId::SHARED_POOL`]
    pub fn new(segment: MemorySegment, profile: &PlatformProfile) -> Result<Self, SharingError> {
        if segment.owner != ComponentId::SHARED_POOL {
            return Err(SharingError::NotAPool(segment.owner));
        }
        let free = FreeList::new(segment.base, segment.size).map_err(|_| SharingError::Fragmented)?;
        debug_print!(
            DEBUG,
            "shared pool at {:#x}+{:#x}, {}",
            segment.base,
            segment.size,
            if profile.has_atomics() { "atomic flags" } else { "single writer" }
        );
        Ok(Self {
            segment,
            free,
            regions: AllocVec::new(),
            atomics: profile.has_atomics(),
            next_id: 0,
        })
    }

    /// Pool segment
    pub const fn segment(&self) -> &MemorySegment {
        &self.segment
    }

    /// Live regions, in creation order
    pub fn regions(&self) -> &[SharedRegion] {
        &self.regions
    }

    /// Live region by id
    pub fn region(&self, id: SharedRegionId) -> Option<&SharedRegion> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Free bytes left in the pool
    pub fn available(&self) -> u64 {
        self.free.total_free()
    }

    /// Pool size against what is carved out of it
    pub fn usage(&self) -> PoolUsage {
        PoolUsage { size: self.segment.size, available: self.available(), regions: self.regions.len() }
    }

    /// Carve a region shared by `sharers`, where `perms[i]` is the access
    /// of `sharers[i]`
    pub fn create_shared_region(
        &mut self,
        sharers: &[ComponentId],
        size: u64,
        perms: &[AccessFlags],
    ) -> Result<SharedRegion, SharingError> {
        if sharers.len() != perms.len() {
            return Err(SharingError::PermissionMismatch { sharers: sharers.len(), permissions: perms.len() });
        }
        let mut list: Vec<Sharer, MAX_SHARERS> = Vec::new();
        for (&component, &access) in sharers.iter().zip(perms) {
            list.push(Sharer { component, access }).map_err(|_| SharingError::TooManySharers)?;
        }
        self.carve(size, list)
    }

    /// Carve a region from a prepared request
    pub fn create(&mut self, request: &SharedRegionRequest) -> Result<SharedRegion, SharingError> {
        if request.overflowed() {
            return Err(SharingError::TooManySharers);
        }
        self.carve(request.size, request.sharers.clone())
    }

    /// Return a region's bytes to the pool
    pub fn release(&mut self, id: SharedRegionId) -> Result<SharedRegion, SharingError> {
        let at = self
            .regions
            .iter()
            .position(|r| r.id == id)
            .ok_or(SharingError::UnknownRegion(id))?;
        let (start, len) = self.regions.get(at).map(SharedRegion::footprint).ok_or(SharingError::UnknownRegion(id))?;
        self.free.release(start, len).map_err(|_| SharingError::Fragmented)?;
        let region = self.regions.remove(at);
        debug_print!(DEBUG, "released {} ({} bytes back in pool)", id, len);
        Ok(region)
    }

    fn carve(&mut self, size: u64, sharers: Vec<Sharer, MAX_SHARERS>) -> Result<SharedRegion, SharingError> {
        check_sharers(&sharers, size, self.atomics)?;

        let available = self.free.largest();
        let footprint = region_footprint(size, self.atomics)
            .ok_or(SharingError::CapacityExceeded { requested: size, available })?;
        let start = self
            .free
            .first_fit(footprint, SHARED_ALIGNMENT, 0)
            .ok()
            .flatten()
            .ok_or(SharingError::CapacityExceeded { requested: footprint, available })?;
        let id = SharedRegionId::new(self.next_id);
        let next_id = self.next_id.checked_add(1).ok_or(SharingError::OutOfIds)?;

        if !self.segment.contains(start, footprint) {
            return Err(outside_pool(id));
        }
        self.free.reserve(start, footprint).map_err(|_| SharingError::Fragmented)?;
        self.next_id = next_id;

        let (base, sync) = if self.atomics {
            (start + SYNC_HEADER_BYTES, SyncHandle::AtomicFlag { offset: start })
        } else {
            let writer = sharers.iter().find(|s| s.access.contains(AccessFlags::WRITE)).map(|s| s.component);
            (start, SyncHandle::SingleWriter { writer })
        };
        let region = SharedRegion { id, base, size, sharers, sync };
        debug_print!(
            DEBUG,
            "carved {} at {:#x}+{:#x} for {} sharer(s)",
            id,
            base,
            size,
            region.sharers.len()
        );
        self.regions.push(region.clone());
        Ok(region)
    }
}

/// Pool bytes one region takes: sync header plus aligned data
fn region_footprint(size: u64, atomics: bool) -> Option<u64> {
    let header = if atomics { SYNC_HEADER_BYTES } else { 0 };
    align_up(size, SHARED_ALIGNMENT)?.checked_add(header)
}

fn check_sharers(sharers: &[Sharer], size: u64, atomics: bool) -> Result<(), SharingError> {
    if size == 0 {
        return Err(SharingError::ZeroSize);
    }
    if sharers.is_empty() {
        return Err(SharingError::NoSharers);
    }
    for (i, sharer) in sharers.iter().enumerate() {
        let component = sharer.component;
        if component == ComponentId::SHARED_POOL {
            return Err(SharingError::InvalidSharer(component));
        }
        if sharers.iter().take(i).any(|s| s.component == component) {
            return Err(SharingError::DuplicateSharer(component));
        }
        if !sharer.access.intersects(AccessFlags::RW) {
            return Err(SharingError::NoAccess(component));
        }
    }

    let writers = sharers.iter().filter(|s| s.access.contains(AccessFlags::WRITE)).count();
    if !atomics && writers > 1 {
        debug_print!(WARN, "rejecting {} writers on a platform without atomics", writers);
        return Err(SharingError::MultipleWriters { writers });
    }
    Ok(())
}

#[allow(clippy::panic)]
fn outside_pool(id: SharedRegionId) -> SharingError {
    let violation = InvariantViolation::SharedOutsidePool { region: id.as_u16() };
    debug_print!(ERROR, "shared pool produced a broken region: {}", violation);
    if cfg!(debug_assertions) {
        panic!("shared pool broke its post-condition: {violation}");
    }
    SharingError::InternalInvariantViolation(violation)
}
