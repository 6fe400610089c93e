//! Component Memory Layout Engine
//!
//! Places independently-compiled WebAssembly components into one shared
//! linear memory. Each component was compiled assuming its memory starts at
//! address 0; this crate gives every component a disjoint, guarded segment
//! of the target platform's memory and rewrites its memory instructions so
//! they address that segment.
//!
//! # Architecture
//!
//! The engine is a pipeline of pure, stateless stages:
//! - [`platform`] resolves a [`platform::PlatformProfile`] (memory budget and region map)
//! - [`memory`] carves guarded [`memory::MemorySegment`]s out of the profile's regions
//! - [`shared`] hands out shared regions from a dedicated shared pool segment
//! - [`safety`] proves memory accesses bounded and provides the runtime bounds check
//! - [`rebase`] rewrites memory-access offsets for the assigned segment
//! - [`layout`] strings the stages together into a [`layout::MergedLayout`]
//!
//! # Safety
//!
//! The layout produced by the allocator always satisfies:
//! - No two segments (guard pages included) intersect
//! - Every segment base honours its requested alignment
//! - Every segment lies inside the region it was carved from
//! - Shared regions live inside the shared pool, never in a private segment
//!
//! A violation of these after allocation is a defect in the allocator and
//! surfaces as [`memory::InvariantViolation`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::panic)]
#![warn(clippy::unwrap_used)]

extern crate alloc;
// The `thiserror-no-std` derive emits paths rooted at `thiserror_no_std`.
extern crate thiserror as thiserror_no_std;

#[macro_use]
mod macros;

pub mod config;
pub mod layout;
pub mod memory;
pub mod platform;
pub mod rebase;
pub mod safety;
pub mod shared;

use alloc::vec::Vec;

pub use config::LayoutConfig;
pub use layout::{LayoutBuilder, MergedLayout};
pub use memory::{AllocationRequest, ComponentId, MemorySegment, SegmentTable};
pub use platform::{PlatformProfile, resolve};

/// Errors surfaced by a layout attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// Profile resolution failed
    #[error(transparent)]
    Profile(#[from] platform::ProfileError),
    /// Segment allocation failed
    #[error(transparent)]
    Allocation(#[from] memory::AllocationError),
    /// Shared region creation failed
    #[error(transparent)]
    Sharing(#[from] shared::SharingError),
    /// Instruction rewriting failed
    #[error(transparent)]
    Rebase(#[from] rebase::RebaseError),
    /// Static analysis rejected a component
    #[error("component {component} rejected: {} unbounded access(es)", .violations.len())]
    ValidationFailed {
        /// Rejected component
        component: ComponentId,
        /// Offending instructions and reasons
        violations: Vec<safety::Violation>,
    },
    /// Configuration is inconsistent
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl LayoutError {
    /// Whether the caller may retry with revised requests.
    ///
    /// Only budget failures qualify. The engine never shrinks a request on
    /// its own, so retrying is always the caller's decision.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Allocation(memory::AllocationError::InsufficientMemory { .. })
                | Self::Sharing(shared::SharingError::CapacityExceeded { .. })
        )
    }

    /// Whether the error indicates a defect in the engine itself
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Allocation(memory::AllocationError::InternalInvariantViolation(_))
                | Self::Sharing(shared::SharingError::InternalInvariantViolation(_))
        )
    }
}

/// Result type for layout operations
pub type LayoutResult<T> = Result<T, LayoutError>;
