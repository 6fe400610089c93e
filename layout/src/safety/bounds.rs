//! Runtime Bounds Checks
//!
//! The runtime side of the validator. A [`BoundsCheck`] strategy decides
//! whether an access is allowed; [`BoundsCheckPolicy`] picks the strategy
//! from the build configuration.
//!
//! # Build Modes
//!
//! - **Debug**: [`RuntimeCheck`] compares every access against the owning
//!   segment and traps with the address and owner on failure
//! - **Release**: [`NoOpCheck`] always allows the access and inlines to
//!   nothing, so checked and unchecked code are identical

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::memory::{ComponentId, MemorySegment};
use crate::rebase::MemoryOp;
use crate::shared::SharedRegion;

/// Direction of an access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// Load
    Read,
    /// Store
    Write,
}

impl AccessKind {
    /// Direction of a memory instruction
    pub const fn of(op: MemoryOp) -> Self {
        if op.is_store() { Self::Write } else { Self::Read }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Strategy deciding whether an access may proceed
pub trait BoundsCheck {
    /// Whether `[addr, addr + size)` lies inside the segment's data range
    fn check_access(&self, addr: u64, size: u64, segment: &MemorySegment) -> bool;

    /// Whether `component` may perform `kind` on `[addr, addr + size)` of a
    /// shared region
    fn check_shared_access(
        &self,
        region: &SharedRegion,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) -> bool;
}

/// Release strategy: every access is allowed
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCheck;

impl BoundsCheck for NoOpCheck {
    #[inline(always)]
    fn check_access(&self, _addr: u64, _size: u64, _segment: &MemorySegment) -> bool {
        true
    }

    #[inline(always)]
    fn check_shared_access(&self, _: &SharedRegion, _: ComponentId, _: u64, _: u64, _: AccessKind) -> bool {
        true
    }
}

/// Debug strategy: accesses are compared against segment and permission bounds
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeCheck;

impl BoundsCheck for RuntimeCheck {
    fn check_access(&self, addr: u64, size: u64, segment: &MemorySegment) -> bool {
        segment.contains(addr, size)
    }

    fn check_shared_access(
        &self,
        region: &SharedRegion,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) -> bool {
        let permitted = match kind {
            AccessKind::Read => region.can_read(component),
            AccessKind::Write => region.can_write(component),
        };
        permitted && region.contains(addr, size)
    }
}

/// Bounds-check strategy chosen by build configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundsCheckPolicy {
    /// No check, zero overhead
    NoOp,
    /// Check every access, trap on violation
    RuntimeCheck,
}

impl Default for BoundsCheckPolicy {
    fn default() -> Self {
        Self::for_build()
    }
}

impl BoundsCheckPolicy {
    /// `RuntimeCheck` with debug assertions, `NoOp` otherwise
    pub const fn for_build() -> Self {
        if cfg!(debug_assertions) { Self::RuntimeCheck } else { Self::NoOp }
    }

    /// Whether the policy performs any check at all
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::RuntimeCheck)
    }

    /// Check an access and trap if it is out of bounds
    #[track_caller]
    pub fn enforce_access(self, addr: u64, size: u64, kind: AccessKind, segment: &MemorySegment) {
        if !self.check_access(addr, size, segment) {
            trap(kind, addr, size, segment.owner);
        }
    }

    /// Check the access a memory instruction makes and trap if it is out of bounds
    #[track_caller]
    pub fn enforce_memory_op(self, op: MemoryOp, addr: u64, segment: &MemorySegment) {
        self.enforce_access(addr, op.width(), AccessKind::of(op), segment);
    }

    /// Check a shared-region access and trap if it is not permitted
    #[track_caller]
    pub fn enforce_shared_access(
        self,
        region: &SharedRegion,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) {
        if !self.check_shared_access(region, component, addr, size, kind) {
            trap(kind, addr, size, component);
        }
    }
}

impl BoundsCheck for BoundsCheckPolicy {
    #[inline(always)]
    fn check_access(&self, addr: u64, size: u64, segment: &MemorySegment) -> bool {
        match self {
            Self::NoOp => NoOpCheck.check_access(addr, size, segment),
            Self::RuntimeCheck => RuntimeCheck.check_access(addr, size, segment),
        }
    }

    #[inline(always)]
    fn check_shared_access(
        &self,
        region: &SharedRegion,
        component: ComponentId,
        addr: u64,
        size: u64,
        kind: AccessKind,
    ) -> bool {
        match self {
            Self::NoOp => NoOpCheck.check_shared_access(region, component, addr, size, kind),
            Self::RuntimeCheck => RuntimeCheck.check_shared_access(region, component, addr, size, kind),
        }
    }
}

#[cold]
#[track_caller]
#[allow(clippy::panic)]
fn trap(kind: AccessKind, addr: u64, size: u64, owner: ComponentId) -> ! {
    debug_print!(ERROR, "bounds check failed: {} of {} bytes at {:#x} by {}", kind, size, addr, owner);
    panic!("out-of-bounds {kind} of {size} bytes at {addr:#x} (segment owner {owner})");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AccessFlags, RegionKind};

    fn segment() -> MemorySegment {
        MemorySegment {
            owner: ComponentId::new(3),
            base: 0x1_0000,
            size: 0x1000,
            guard: 0x1000,
            alignment: 16,
            region: RegionKind::Main,
            access: AccessFlags::RW,
        }
    }

    #[test]
    fn runtime_check_matches_segment_bounds() {
        let s = segment();
        assert!(RuntimeCheck.check_access(0x1_0000, 4, &s));
        assert!(RuntimeCheck.check_access(0x1_0FFC, 4, &s));
        assert!(!RuntimeCheck.check_access(0x1_0FFD, 4, &s));
        assert!(!RuntimeCheck.check_access(0xFFFF, 1, &s));
        assert!(!RuntimeCheck.check_access(u64::MAX, 2, &s));
    }

    #[test]
    fn noop_allows_everything() {
        let s = segment();
        assert!(BoundsCheckPolicy::NoOp.check_access(0, u64::MAX, &s));
        assert!(!BoundsCheckPolicy::NoOp.is_enabled());
        BoundsCheckPolicy::NoOp.enforce_access(0x9999_0000, 8, AccessKind::Write, &s);
    }

    #[test]
    fn policy_follows_build_mode() {
        assert_eq!(BoundsCheckPolicy::for_build().is_enabled(), cfg!(debug_assertions));
        assert_eq!(BoundsCheckPolicy::default(), BoundsCheckPolicy::for_build());
    }

    #[test]
    #[should_panic(expected = "out-of-bounds read of 4 bytes at 0x11000 (segment owner #3)")]
    fn runtime_check_traps_with_address_and_owner() {
        BoundsCheckPolicy::RuntimeCheck.enforce_access(0x1_1000, 4, AccessKind::Read, &segment());
    }

    #[test]
    #[should_panic(expected = "out-of-bounds write of 8 bytes at 0x10ffc (segment owner #3)")]
    fn store_past_the_segment_traps_as_a_write() {
        BoundsCheckPolicy::RuntimeCheck.enforce_memory_op(MemoryOp::I64Store, 0x1_0FFC, &segment());
    }

    #[test]
    fn in_bounds_instructions_pass() {
        let s = segment();
        BoundsCheckPolicy::RuntimeCheck.enforce_memory_op(MemoryOp::I32Store8, 0x1_0FFF, &s);
        BoundsCheckPolicy::RuntimeCheck.enforce_memory_op(MemoryOp::I64Load, 0x1_0FF8, &s);
        assert_eq!(AccessKind::of(MemoryOp::I32Store16), AccessKind::Write);
        assert_eq!(AccessKind::of(MemoryOp::F64Load), AccessKind::Read);
    }
}
