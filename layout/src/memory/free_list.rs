//! Region Free-Lists
//!
//! A free-list is a sorted set of disjoint `(start, len)` gaps inside one
//! region. Gaps are kept in address order and never touch each other:
//! releasing a range next to an existing gap merges them.
//!
//! # Time Complexity
//!
//! - First fit: O(g) where g is the number of gaps
//! - Reserve / release: O(g)
//!
//! The gap count is bounded by [`MAX_GAPS`], so every operation runs in
//! bounded time.

use heapless::Vec;
use static_assertions::const_assert;

use super::{MAX_SEGMENTS, align_up};

/// Maximum number of gaps a single free-list tracks.
///
/// Every placement can leave an alignment gap in front of it and a tail
/// gap behind it, so a full layout needs one gap per segment plus one.
pub const MAX_GAPS: usize = 2 * MAX_SEGMENTS + 1;

const_assert!(MAX_GAPS > MAX_SEGMENTS);

/// Free-list errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FreeListError {
    /// No slot left to record another gap
    #[error("free-list is full")]
    Full,
    /// The range is not entirely free
    #[error("range {base:#x}+{len:#x} is not free")]
    NotFree {
        /// Range start
        base: u64,
        /// Range length
        len: u64,
    },
    /// The range is already (partly) free
    #[error("range {base:#x}+{len:#x} overlaps a free gap")]
    DoubleFree {
        /// Range start
        base: u64,
        /// Range length
        len: u64,
    },
    /// Range arithmetic wraps the address space
    #[error("range arithmetic overflows")]
    Overflow,
}

/// A free byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gap {
    /// First free byte
    pub start: u64,
    /// Number of free bytes
    pub len: u64,
}

impl Gap {
    /// One past the last free byte
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Sorted, coalesced set of free gaps
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FreeList {
    gaps: Vec<Gap, MAX_GAPS>,
}

impl FreeList {
    /// Free-list with no free space
    pub const fn empty() -> Self {
        Self { gaps: Vec::new() }
    }

    /// Free-list covering `[start, start + len)` entirely
    pub fn new(start: u64, len: u64) -> Result<Self, FreeListError> {
        start.checked_add(len).ok_or(FreeListError::Overflow)?;
        let mut list = Self::empty();
        if len > 0 {
            list.gaps.push(Gap { start, len }).map_err(|_| FreeListError::Full)?;
        }
        Ok(list)
    }

    /// Gaps in address order
    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Size of the largest gap
    pub fn largest(&self) -> u64 {
        self.gaps.iter().map(|g| g.len).max().unwrap_or(0)
    }

    /// Total free bytes
    pub fn total_free(&self) -> u64 {
        self.gaps.iter().map(|g| g.len).sum()
    }

    /// Lowest base, aligned to `align`, whose `size + trailing` bytes fit in
    /// one gap.
    ///
    /// Gaps are scanned in address order, so ties between equally good gaps
    /// go to the lowest address.
    pub fn first_fit(&self, size: u64, align: u64, trailing: u64) -> Result<Option<u64>, FreeListError> {
        let footprint = size.checked_add(trailing).ok_or(FreeListError::Overflow)?;
        for gap in &self.gaps {
            let base = align_up(gap.start, align).ok_or(FreeListError::Overflow)?;
            let end = base.checked_add(footprint).ok_or(FreeListError::Overflow)?;
            if end <= gap.end() {
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    /// Smallest number of bytes by which any gap misses a fit.
    ///
    /// Equals the whole footprint when the list is empty.
    pub fn deficit(&self, size: u64, align: u64, trailing: u64) -> u64 {
        let footprint = size.saturating_add(trailing);
        self.gaps
            .iter()
            .map(|gap| {
                let base = align_up(gap.start, align).unwrap_or(u64::MAX);
                base.saturating_add(footprint).saturating_sub(gap.end())
            })
            .min()
            .unwrap_or(footprint)
    }

    /// Remove `[base, base + len)` from the free set.
    ///
    /// The range must lie inside a single gap. Leftover space before and
    /// after it stays free.
    pub fn reserve(&mut self, base: u64, len: u64) -> Result<(), FreeListError> {
        let end = base.checked_add(len).ok_or(FreeListError::Overflow)?;
        let index = self
            .gaps
            .iter()
            .position(|g| g.start <= base && end <= g.end())
            .ok_or(FreeListError::NotFree { base, len })?;
        let gap = self.gaps.get(index).copied().ok_or(FreeListError::NotFree { base, len })?;

        let before = Gap { start: gap.start, len: base - gap.start };
        let after = Gap { start: end, len: gap.end() - end };
        if before.len > 0 && after.len > 0 && self.gaps.is_full() {
            return Err(FreeListError::Full);
        }
        self.gaps.remove(index);

        let mut at = index;
        for piece in [before, after] {
            if piece.len > 0 {
                self.gaps.insert(at, piece).map_err(|_| FreeListError::Full)?;
                at += 1;
            }
        }
        Ok(())
    }

    /// Return `[base, base + len)` to the free set, merging with neighbours
    pub fn release(&mut self, base: u64, len: u64) -> Result<(), FreeListError> {
        let end = base.checked_add(len).ok_or(FreeListError::Overflow)?;
        if len == 0 {
            return Ok(());
        }
        if self.gaps.iter().any(|g| g.start < end && base < g.end()) {
            return Err(FreeListError::DoubleFree { base, len });
        }

        let at = self.gaps.iter().position(|g| g.start > base).unwrap_or(self.gaps.len());
        self.gaps.insert(at, Gap { start: base, len }).map_err(|_| FreeListError::Full)?;

        // merge with the following gap, then with the preceding one
        if let (Some(cur), Some(next)) = (self.gaps.get(at).copied(), self.gaps.get(at + 1).copied()) {
            if cur.end() == next.start {
                self.gaps.remove(at + 1);
                if let Some(slot) = self.gaps.get_mut(at) {
                    slot.len += next.len;
                }
            }
        }
        if at > 0 {
            if let (Some(prev), Some(cur)) = (self.gaps.get(at - 1).copied(), self.gaps.get(at).copied()) {
                if prev.end() == cur.start {
                    self.gaps.remove(at);
                    if let Some(slot) = self.gaps.get_mut(at - 1) {
                        slot.len += cur.len;
                    }
                }
            }
        }
        Ok(())
    }
}
