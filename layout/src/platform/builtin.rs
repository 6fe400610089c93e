//! Built-in Platform Profiles
//!
//! Hard-coded region maps for the targets the engine knows about. Region
//! bases are offsets in the merged linear memory, not physical addresses:
//! each kind of memory gets its own window, laid out back to back.
//!
//! # Memory Maps
//!
//! ```text
//! handheld-2m:
//! 0x0000_0000 - 0x001F_FFFF : main (2MB)
//! 0x0020_0000 - 0x002F_FFFF : video (1MB)
//! 0x0030_0000 - 0x0030_3FFF : scratchpad (16KB)
//!
//! dreamcast:
//! 0x0000_0000 - 0x00FF_FFFF : main (16MB)
//! 0x0100_0000 - 0x017F_FFFF : video (8MB)
//! 0x0180_0000 - 0x019F_FFFF : audio (2MB)
//! 0x01A0_0000 - 0x01A0_1FFF : scratchpad (8KB)
//!
//! psp:
//! 0x0000_0000 - 0x01FF_FFFF : main (32MB)
//! 0x0200_0000 - 0x021F_FFFF : video (2MB)
//! 0x0220_0000 - 0x0220_3FFF : scratchpad (16KB)
//!
//! vita:
//! 0x0000_0000 - 0x1FFF_FFFF : main (512MB)
//! 0x2000_0000 - 0x27FF_FFFF : video (128MB)
//! ```

use super::{
    AccessFlags, MemoryRegion, PlatformProfile, RegionAttributes, RegionKind, WASM_PAGE_SIZE,
    platform_id,
};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Ids with a built-in profile, aliases included
pub const KNOWN_PLATFORMS: &[&str] = &[
    "handheld-2m",
    "dreamcast",
    "psp",
    "vita",
    "web",
    "desktop",
    "linux",
    "macos",
    "windows",
];

const RAM: RegionAttributes = RegionAttributes::CACHEABLE.union(RegionAttributes::DMA);
const VRAM: RegionAttributes = RegionAttributes::DMA.union(RegionAttributes::VOLATILE);
const SRAM: RegionAttributes = RegionAttributes::CACHEABLE;

/// Look up a built-in profile by id or alias
pub fn lookup(id: &str) -> Option<PlatformProfile> {
    let canonical = match id {
        "linux" | "macos" | "windows" => "desktop",
        other => other,
    };

    match canonical {
        "handheld-2m" => build(
            canonical,
            2 * MB,
            4 * KB,
            16,
            &[
                MemoryRegion::new(RegionKind::Main, 0, 2 * MB, AccessFlags::RW, RAM),
                MemoryRegion::new(RegionKind::Video, 0x0020_0000, MB, AccessFlags::RW, VRAM),
                MemoryRegion::new(RegionKind::Scratchpad, 0x0030_0000, 16 * KB, AccessFlags::RW, SRAM),
            ],
            (false, true, false),
        ),
        "dreamcast" => build(
            canonical,
            16 * MB,
            4 * KB,
            32,
            &[
                MemoryRegion::new(RegionKind::Main, 0, 16 * MB, AccessFlags::RW, RAM),
                MemoryRegion::new(RegionKind::Video, 0x0100_0000, 8 * MB, AccessFlags::RW, VRAM),
                MemoryRegion::new(RegionKind::Audio, 0x0180_0000, 2 * MB, AccessFlags::RW, VRAM),
                MemoryRegion::new(RegionKind::Scratchpad, 0x01A0_0000, 8 * KB, AccessFlags::RW, SRAM),
            ],
            (false, true, false),
        ),
        "psp" => build(
            canonical,
            32 * MB,
            4 * KB,
            16,
            &[
                MemoryRegion::new(RegionKind::Main, 0, 32 * MB, AccessFlags::RW, RAM),
                MemoryRegion::new(RegionKind::Video, 0x0200_0000, 2 * MB, AccessFlags::RW, VRAM),
                MemoryRegion::new(RegionKind::Scratchpad, 0x0220_0000, 16 * KB, AccessFlags::RW, SRAM),
            ],
            (false, true, true),
        ),
        "vita" => build(
            canonical,
            512 * MB,
            4 * KB,
            16,
            &[
                MemoryRegion::new(RegionKind::Main, 0, 512 * MB, AccessFlags::RW, RAM),
                MemoryRegion::new(RegionKind::Video, 0x2000_0000, 128 * MB, AccessFlags::RW, VRAM),
            ],
            (true, true, true),
        ),
        "web" => build(
            canonical,
            2 * GB,
            WASM_PAGE_SIZE,
            16,
            &[MemoryRegion::new(RegionKind::Main, 0, 2 * GB, AccessFlags::RW, SRAM)],
            (true, false, true),
        ),
        // wasm32 addresses at most 4GiB of linear memory
        "desktop" => build(
            canonical,
            4 * GB,
            WASM_PAGE_SIZE,
            16,
            &[MemoryRegion::new(RegionKind::Main, 0, 4 * GB, AccessFlags::RW, SRAM)],
            (true, false, true),
        ),
        _ => None,
    }
}

fn build(
    id: &str,
    total_memory: u64,
    page_size: u64,
    default_alignment: u64,
    regions: &[MemoryRegion],
    caps: (bool, bool, bool),
) -> Option<PlatformProfile> {
    match PlatformProfile::from_parts(platform_id(id), total_memory, page_size, default_alignment, regions, caps) {
        Ok(profile) => Some(profile),
        Err(fault) => {
            debug_print!(ERROR, "built-in profile {} is inconsistent: {}", id, fault);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::platform::resolve;

    #[test]
    fn every_known_platform_resolves() {
        for id in KNOWN_PLATFORMS {
            let profile = resolve(id).unwrap();
            assert!(profile.region(RegionKind::Main).is_some(), "{id} has no main region");
        }
    }

    #[test]
    fn handheld_matches_its_budget() {
        let profile = resolve("handheld-2m").unwrap();
        assert_eq!(profile.total_memory(), 2_097_152);
        assert_eq!(profile.region(RegionKind::Main).unwrap().size, 2_097_152);
        assert_eq!(profile.region(RegionKind::Video).unwrap().size, 1_048_576);
        assert!(!profile.has_mmu());
        assert!(!profile.has_atomics());
    }

    #[test]
    fn dreamcast_matches_its_budget() {
        let profile = resolve("dreamcast").unwrap();
        assert_eq!(profile.total_memory(), 16 * MB);
        assert_eq!(profile.region(RegionKind::Video).unwrap().size, 8 * MB);
        assert_eq!(profile.default_alignment(), 32);
    }

    #[test]
    fn aliases_share_the_desktop_profile() {
        let linux = resolve("linux").unwrap();
        assert_eq!(linux.id(), "desktop");
        assert_eq!(linux, resolve("windows").unwrap());
        assert!(!linux.is_constrained());
        assert_eq!(linux.region(RegionKind::Main).unwrap().end(), Some(1 << 32));
    }

    #[test]
    fn resolution_is_pure() {
        assert_eq!(resolve("psp").unwrap(), resolve("psp").unwrap());
    }
}
