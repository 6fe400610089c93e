//! Shared Memory Protocol
//!
//! Regions of memory that more than one component may access, each with its
//! own per-sharer permissions and a synchronization handle.
//!
//! # Design Principles
//!
//! - Shared regions are carved from one dedicated pool segment owned by
//!   [`ComponentId::SHARED_POOL`], never from a sharer's private segment
//! - The pool is sized up front with [`SharedPool::budget`]; a region that
//!   does not fit fails with [`SharingError::CapacityExceeded`]
//! - Permissions are per sharer: one sharer may read and write while
//!   another only reads
//! - On profiles without atomics at most one sharer may write
//!
//! # Region Layout
//!
//! ```text
//! With atomics:
//! ┌───────────────────────┬──────────────────────────────┐
//! │ sync header (16 bytes) │ shared data                  │
//! └───────────────────────┴──────────────────────────────┘
//!  ^ SyncHandle::AtomicFlag  ^ SharedRegion::base
//!
//! Without atomics:
//! ┌──────────────────────────────────────────────────────┐
//! │ shared data (single writer)                          │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Runtime Contract
//!
//! A sharer must acquire the region's handle before a write another sharer
//! may read concurrently. The engine only allocates the handle; the lock or
//! atomic primitive belongs to the runtime.

#![deny(missing_docs)]

use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::memory::{ComponentId, InvariantViolation, align_up};
use crate::platform::AccessFlags;

pub mod pool;

pub use pool::SharedPool;

/// Maximum number of sharers of one region
pub const MAX_SHARERS: usize = 16;

/// Alignment of every shared region and of the pool itself
pub const SHARED_ALIGNMENT: u64 = 16;

/// Bytes reserved ahead of a region for its atomic flag word
pub const SYNC_HEADER_BYTES: u64 = 16;

/// Shared region identifier, unique within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SharedRegionId(u16);

impl SharedRegionId {
    /// Create a new region ID
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SharedRegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared#{}", self.0)
    }
}

/// One component's access to a shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sharer {
    /// Sharing component
    pub component: ComponentId,
    /// What it may do
    pub access: AccessFlags,
}

/// Synchronization handle of a shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncHandle {
    /// Flag word at `offset`, acquired with an atomic read-modify-write
    AtomicFlag {
        /// Address of the flag word
        offset: u64,
    },
    /// No lock; only `writer` may store
    SingleWriter {
        /// The only sharer with write permission, if any
        writer: Option<ComponentId>,
    },
}

/// A byte range accessible by several components under declared permissions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedRegion {
    /// Identifier within the pool
    pub id: SharedRegionId,
    /// First data byte
    pub base: u64,
    /// Data bytes
    pub size: u64,
    /// Sharers and their permissions
    pub sharers: Vec<Sharer, MAX_SHARERS>,
    /// How sharers serialize writes
    pub sync: SyncHandle,
}

impl SharedRegion {
    /// One past the last data byte
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Permissions of a component, `None` if it is not a sharer
    pub fn permissions(&self, component: ComponentId) -> Option<AccessFlags> {
        self.sharers.iter().find(|s| s.component == component).map(|s| s.access)
    }

    /// Whether the component may read
    pub fn can_read(&self, component: ComponentId) -> bool {
        self.permissions(component).is_some_and(|a| a.contains(AccessFlags::READ))
    }

    /// Whether the component may write
    pub fn can_write(&self, component: ComponentId) -> bool {
        self.permissions(component).is_some_and(|a| a.contains(AccessFlags::WRITE))
    }

    /// Sharers with write permission
    pub fn writers(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.sharers
            .iter()
            .filter(|s| s.access.contains(AccessFlags::WRITE))
            .map(|s| s.component)
    }

    /// Whether `[addr, addr + len)` lies inside the data range
    pub const fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Pool bytes the region occupies, sync header included
    pub fn footprint(&self) -> (u64, u64) {
        let start = match self.sync {
            SyncHandle::AtomicFlag { offset } => offset,
            SyncHandle::SingleWriter { .. } => self.base,
        };
        let data = align_up(self.size, SHARED_ALIGNMENT).unwrap_or(self.size);
        (start, self.base - start + data)
    }
}

/// A shared region to be created once the pool exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegionRequest {
    /// Data bytes
    pub size: u64,
    /// Sharers and their permissions
    pub sharers: Vec<Sharer, MAX_SHARERS>,
    overflowed: bool,
}

impl SharedRegionRequest {
    /// Request with no sharers yet
    pub const fn new(size: u64) -> Self {
        Self { size, sharers: Vec::new(), overflowed: false }
    }

    /// Add a sharer.
    ///
    /// A sharer past [`MAX_SHARERS`] cannot be recorded; the request is
    /// marked [`overflowed`](Self::overflowed) and creating the region
    /// fails with [`SharingError::TooManySharers`].
    #[must_use]
    pub fn sharer(mut self, component: ComponentId, access: AccessFlags) -> Self {
        if self.sharers.push(Sharer { component, access }).is_err() {
            debug_print!(WARN, "shared region request is full, {} cannot be added", component);
            self.overflowed = true;
        }
        self
    }

    /// Whether more than [`MAX_SHARERS`] sharers were requested
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Shared region errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SharingError {
    /// The pool has no gap large enough
    #[error("shared pool cannot absorb {requested} bytes ({available} bytes in the largest gap)")]
    CapacityExceeded {
        /// Pool bytes the region needs
        requested: u64,
        /// Largest free gap
        available: u64,
    },
    /// No sharers listed
    #[error("shared region has no sharers")]
    NoSharers,
    /// A component is listed twice
    #[error("{0} is listed twice as a sharer")]
    DuplicateSharer(ComponentId),
    /// Sharer and permission lists differ in length
    #[error("{sharers} sharer(s) but {permissions} permission set(s)")]
    PermissionMismatch {
        /// Sharer count
        sharers: usize,
        /// Permission count
        permissions: usize,
    },
    /// A sharer may neither read nor write
    #[error("{0} has no access to the region it shares")]
    NoAccess(ComponentId),
    /// More than one writer on a profile without atomics
    #[error("{writers} writers requested, but the platform has no atomics")]
    MultipleWriters {
        /// Number of sharers with write permission
        writers: usize,
    },
    /// More than [`MAX_SHARERS`] sharers
    #[error("more than {} sharers", MAX_SHARERS)]
    TooManySharers,
    /// The synthetic pool owner cannot share
    #[error("{0} cannot be a sharer")]
    InvalidSharer(ComponentId),
    /// Size is zero
    #[error("shared region size is zero")]
    ZeroSize,
    /// Segment handed to the pool belongs to a component
    #[error("segment owned by {0} is not a shared pool")]
    NotAPool(ComponentId),
    /// The pool free-list cannot track another gap
    #[error("shared pool is too fragmented")]
    Fragmented,
    /// Every region id of this pool has been handed out
    #[error("shared pool ran out of region ids")]
    OutOfIds,
    /// No region with this id
    #[error("no shared region {0}")]
    UnknownRegion(SharedRegionId),
    /// The pool broke its own post-condition
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(InvariantViolation),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(sync: SyncHandle) -> SharedRegion {
        let a = Sharer { component: ComponentId::new(1), access: AccessFlags::RW };
        let b = Sharer { component: ComponentId::new(2), access: AccessFlags::READ };
        let mut sharers = Vec::new();
        let _ = sharers.push(a);
        let _ = sharers.push(b);
        SharedRegion { id: SharedRegionId::new(0), base: 0x1010, size: 0x28, sharers, sync }
    }

    #[test]
    fn permissions_are_per_sharer() {
        let r = region(SyncHandle::AtomicFlag { offset: 0x1000 });
        assert!(r.can_write(ComponentId::new(1)));
        assert!(r.can_read(ComponentId::new(2)));
        assert!(!r.can_write(ComponentId::new(2)));
        assert!(!r.can_read(ComponentId::new(3)));
        assert_eq!(r.writers().collect::<std::vec::Vec<_>>(), [ComponentId::new(1)]);
    }

    #[test]
    fn footprint_covers_header_and_padding() {
        let atomic = region(SyncHandle::AtomicFlag { offset: 0x1000 });
        assert_eq!(atomic.footprint(), (0x1000, 0x40));
        let single = region(SyncHandle::SingleWriter { writer: Some(ComponentId::new(1)) });
        assert_eq!(single.footprint(), (0x1010, 0x30));
    }

    #[test]
    fn contains_stays_inside_the_data() {
        let r = region(SyncHandle::SingleWriter { writer: None });
        assert!(r.contains(0x1010, 0x28));
        assert!(!r.contains(0x1000, 4));
        assert!(!r.contains(0x1034, 8));
    }
}
