//! Platform Memory Profiles
//!
//! This module describes the memory budget of each build target as data.
//! A [`PlatformProfile`] is resolved once per build target and never mutated
//! afterwards; every later stage of the pipeline reads from it.
//!
//! # Supported Platforms
//!
//! - **handheld-2m**: 2MB main memory, 1MB video memory, no MMU
//! - **dreamcast**: 16MB main, 8MB video, 2MB audio, no atomics
//! - **psp**: 32MB main, 2MB video, 16KB scratchpad
//! - **vita**: 512MB main, 128MB video, MMU
//! - **web** / **desktop**: unconstrained virtual memory
//! - **declared**: any other id, from constraints supplied by the HAL
//!
//! # Design Principles
//!
//! - Platform differences are sizes and alignments, so they live in values
//! - Regions never overlap within a profile
//! - Unknown platforms fail loudly instead of falling back silently

#![deny(missing_docs)]

use alloc::vec::Vec as AllocVec;
use core::fmt;

use bitflags::bitflags;
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;

pub mod builtin;

/// Maximum number of regions a single profile can describe
pub const MAX_REGIONS: usize = 8;

/// Maximum length of a platform identifier
pub const MAX_PLATFORM_ID_LEN: usize = 32;

/// Size of a WebAssembly linear-memory page
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Platform identifier
pub type PlatformId = String<MAX_PLATFORM_ID_LEN>;

assert_impl_all!(PlatformProfile: Send, Sync);

/// Build a [`PlatformId`], truncating ids longer than [`MAX_PLATFORM_ID_LEN`].
pub fn platform_id(id: &str) -> PlatformId {
    let mut out = PlatformId::new();
    for ch in id.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Kind of memory a region provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegionKind {
    /// General-purpose system RAM
    Main = 0,
    /// Video memory
    Video = 1,
    /// Audio memory
    Audio = 2,
    /// Small fast on-chip memory
    Scratchpad = 3,
    /// Memory-mapped I/O window
    Io = 4,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Scratchpad => "scratchpad",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Access rights on a region or segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessFlags: u8 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
        /// Read-write shorthand
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

bitflags! {
    /// Hardware attributes of a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RegionAttributes: u8 {
        /// Accesses go through the data cache
        const CACHEABLE = 1 << 0;
        /// Reachable by the DMA controller
        const DMA = 1 << 1;
        /// Accesses have side effects and must not be reordered
        const VOLATILE = 1 << 2;
        /// May be mapped into more than one component
        const SHARED = 1 << 3;
    }
}

/// A named, contiguous range of platform memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// What this region is used for
    pub kind: RegionKind,
    /// First byte of the region in the merged address space
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// Permitted access
    pub access: AccessFlags,
    /// Hardware attributes
    pub attributes: RegionAttributes,
}

impl MemoryRegion {
    /// Create a region descriptor
    pub const fn new(
        kind: RegionKind,
        base: u64,
        size: u64,
        access: AccessFlags,
        attributes: RegionAttributes,
    ) -> Self {
        Self { kind, base, size, access, attributes }
    }

    /// One past the last byte, or `None` if the region wraps the address space
    pub const fn end(&self) -> Option<u64> {
        self.base.checked_add(self.size)
    }

    /// Whether `[base, base + len)` lies entirely inside this region
    pub fn contains_range(&self, base: u64, len: u64) -> bool {
        match (self.end(), base.checked_add(len)) {
            (Some(end), Some(range_end)) => base >= self.base && range_end <= end,
            _ => false,
        }
    }

    /// Whether two regions share at least one byte
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self.end(), other.end()) {
            (Some(a_end), Some(b_end)) => self.base < b_end && other.base < a_end,
            _ => true,
        }
    }

    /// Whether the region is reachable by DMA
    pub const fn is_dma_accessible(&self) -> bool {
        self.attributes.contains(RegionAttributes::DMA)
    }
}

/// Resolved memory budget and region map of a build target.
///
/// Immutable once built: fields are only readable, and the only
/// constructors validate the region map. Decoding goes through
/// [`DeclaredConstraints`] and applies the same checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeclaredConstraints")]
pub struct PlatformProfile {
    id: PlatformId,
    total_memory: u64,
    page_size: u64,
    default_alignment: u64,
    regions: Vec<MemoryRegion, MAX_REGIONS>,
    has_mmu: bool,
    has_dma: bool,
    has_atomics: bool,
}

impl PlatformProfile {
    /// Platform identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Total general-purpose memory in bytes
    pub const fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Page size used for guard pages
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Alignment used for requests that do not state one
    pub const fn default_alignment(&self) -> u64 {
        self.default_alignment
    }

    /// All regions, sorted by base address
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Lowest-addressed region of the given kind
    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    /// All regions of the given kind, lowest address first
    pub fn regions_of(&self, kind: RegionKind) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(move |r| r.kind == kind)
    }

    /// Platform has a memory management unit
    pub const fn has_mmu(&self) -> bool {
        self.has_mmu
    }

    /// Platform has a DMA controller
    pub const fn has_dma(&self) -> bool {
        self.has_dma
    }

    /// Platform provides atomic read-modify-write instructions
    pub const fn has_atomics(&self) -> bool {
        self.has_atomics
    }

    /// Whether the target lacks virtual memory to absorb overcommit
    pub const fn is_constrained(&self) -> bool {
        !self.has_mmu
    }
}

/// Why a declared profile was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeclarationFault {
    /// Page size is zero or not a power of two
    #[error("page size {0} is not a power of two")]
    PageSize(u64),
    /// Default alignment is zero or not a power of two
    #[error("default alignment {0} is not a power of two")]
    Alignment(u64),
    /// No regions declared
    #[error("no memory regions declared")]
    NoRegions,
    /// A region is empty or wraps the address space
    #[error("{0} region is empty or wraps the address space")]
    BadRegion(RegionKind),
    /// Two regions overlap
    #[error("{0} region overlaps {1} region")]
    Overlap(RegionKind, RegionKind),
    /// Total memory is zero
    #[error("total memory is zero")]
    NoMemory,
    /// More regions than a profile can hold
    #[error("more than {} regions declared", MAX_REGIONS)]
    TooManyRegions,
}

/// Profile resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    /// No built-in or declared profile matches the id
    #[error("unsupported platform `{0}`")]
    UnsupportedPlatform(PlatformId),
    /// Declared constraints are inconsistent
    #[error("invalid constraints for `{platform}`: {fault}")]
    InvalidDeclaration {
        /// Platform the declaration was for
        platform: PlatformId,
        /// What is wrong with it
        fault: DeclarationFault,
    },
    /// The id is already taken by a built-in or earlier declaration
    #[error("platform `{0}` is already defined")]
    DuplicatePlatform(PlatformId),
    /// Declaration bytes could not be decoded
    #[error("malformed constraint declaration")]
    Malformed,
}

/// Platform constraints supplied by the HAL for targets without a built-in profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredConstraints {
    /// Platform identifier
    pub id: PlatformId,
    /// Total general-purpose memory in bytes
    pub total_memory: u64,
    /// Page size in bytes
    pub page_size: u64,
    /// Default alignment in bytes
    pub default_alignment: u64,
    /// Region map
    pub regions: Vec<MemoryRegion, MAX_REGIONS>,
    /// MMU present
    pub has_mmu: bool,
    /// DMA controller present
    pub has_dma: bool,
    /// Atomic instructions available
    pub has_atomics: bool,
}

impl DeclaredConstraints {
    /// Decode constraints from their postcard encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProfileError> {
        postcard::from_bytes(bytes).map_err(|_| ProfileError::Malformed)
    }

    /// Encode constraints with postcard
    pub fn to_bytes(&self) -> Result<AllocVec<u8>, ProfileError> {
        postcard::to_allocvec(self).map_err(|_| ProfileError::Malformed)
    }

    /// Validate the declaration and turn it into a profile
    pub fn into_profile(self) -> Result<PlatformProfile, ProfileError> {
        let fault = |fault| ProfileError::InvalidDeclaration {
            platform: self.id.clone(),
            fault,
        };

        if self.total_memory == 0 {
            return Err(fault(DeclarationFault::NoMemory));
        }
        if !self.page_size.is_power_of_two() {
            return Err(fault(DeclarationFault::PageSize(self.page_size)));
        }
        if !self.default_alignment.is_power_of_two() {
            return Err(fault(DeclarationFault::Alignment(self.default_alignment)));
        }

        let profile = PlatformProfile::from_parts(
            self.id.clone(),
            self.total_memory,
            self.page_size,
            self.default_alignment,
            &self.regions,
            (self.has_mmu, self.has_dma, self.has_atomics),
        )
        .map_err(fault)?;
        Ok(profile)
    }
}

impl TryFrom<DeclaredConstraints> for PlatformProfile {
    type Error = ProfileError;

    fn try_from(constraints: DeclaredConstraints) -> Result<Self, Self::Error> {
        constraints.into_profile()
    }
}

impl PlatformProfile {
    /// Assemble a profile, sorting regions by base and rejecting overlaps
    pub(crate) fn from_parts(
        id: PlatformId,
        total_memory: u64,
        page_size: u64,
        default_alignment: u64,
        regions: &[MemoryRegion],
        (has_mmu, has_dma, has_atomics): (bool, bool, bool),
    ) -> Result<Self, DeclarationFault> {
        let mut sorted: Vec<MemoryRegion, MAX_REGIONS> = Vec::new();
        for region in regions {
            if region.size == 0 || region.end().is_none() {
                return Err(DeclarationFault::BadRegion(region.kind));
            }
            if let Some(other) = sorted.iter().find(|r| r.overlaps(region)) {
                return Err(DeclarationFault::Overlap(region.kind, other.kind));
            }
            let at = sorted.iter().position(|r| r.base > region.base).unwrap_or(sorted.len());
            sorted.insert(at, *region).map_err(|_| DeclarationFault::TooManyRegions)?;
        }
        if sorted.is_empty() {
            return Err(DeclarationFault::NoRegions);
        }

        Ok(Self {
            id,
            total_memory,
            page_size,
            default_alignment,
            regions: sorted,
            has_mmu,
            has_dma,
            has_atomics,
        })
    }
}

/// Resolve one of the built-in profiles.
///
/// Pure lookup: no side effects, identical ids always give identical
/// profiles. Use [`ProfileResolver`] to add HAL-declared platforms.
pub fn resolve(platform: &str) -> Result<PlatformProfile, ProfileError> {
    let profile = builtin::lookup(platform)
        .ok_or_else(|| ProfileError::UnsupportedPlatform(platform_id(platform)))?;
    debug_print!(
        DEBUG,
        "resolved built-in profile {} ({} bytes, {} regions)",
        profile.id(),
        profile.total_memory(),
        profile.regions().len()
    );
    Ok(profile)
}

/// Built-in profiles plus constraints declared by the HAL
#[derive(Debug, Clone, Default)]
pub struct ProfileResolver {
    declared: AllocVec<PlatformProfile>,
}

impl ProfileResolver {
    /// Resolver that only knows the built-in profiles
    pub const fn new() -> Self {
        Self { declared: AllocVec::new() }
    }

    /// Register constraints for a platform without a built-in profile
    pub fn declare(&mut self, constraints: DeclaredConstraints) -> Result<(), ProfileError> {
        if builtin::lookup(&constraints.id).is_some()
            || self.declared.iter().any(|p| p.id == constraints.id)
        {
            return Err(ProfileError::DuplicatePlatform(constraints.id));
        }
        let profile = constraints.into_profile()?;
        debug_print!(INFO, "declared profile {} ({} regions)", profile.id(), profile.regions().len());
        self.declared.push(profile);
        Ok(())
    }

    /// Register constraints from their postcard encoding
    pub fn declare_bytes(&mut self, bytes: &[u8]) -> Result<(), ProfileError> {
        self.declare(DeclaredConstraints::from_bytes(bytes)?)
    }

    /// Resolve a built-in profile first, then a declared one
    pub fn resolve(&self, platform: &str) -> Result<PlatformProfile, ProfileError> {
        if let Some(profile) = builtin::lookup(platform) {
            return Ok(profile);
        }
        self.declared
            .iter()
            .find(|p| p.id() == platform)
            .cloned()
            .ok_or_else(|| ProfileError::UnsupportedPlatform(platform_id(platform)))
    }
}
