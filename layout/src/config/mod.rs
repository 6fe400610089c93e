//! Layout Configuration
//!
//! Knobs shared by every stage of one layout attempt. The defaults mirror
//! `[package.metadata.layout-defaults]` in the crate manifest.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::memory::{DEFAULT_GUARD_BYTES, FallbackTable, MAX_FALLBACKS};
use crate::platform::RegionKind;
use crate::rebase::ScratchLocals;
use crate::safety::BoundsCheckPolicy;

/// Guard sizes must keep this granularity
pub const GUARD_GRANULE: u64 = 16;

/// Configuration of one layout attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Guard bytes after every segment
    pub guard_bytes: u64,
    /// Region fallback rules
    pub fallbacks: FallbackTable,
    /// Runtime bounds-check strategy handed to the runtime
    pub bounds_check: BoundsCheckPolicy,
    /// Whether rebasing records relocation tables
    pub emit_relocations: bool,
    /// Guard unproven accesses with these scratch locals instead of
    /// rejecting the component
    pub inject_checks: Option<ScratchLocals>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            guard_bytes: DEFAULT_GUARD_BYTES,
            fallbacks: FallbackTable::default(),
            bounds_check: BoundsCheckPolicy::for_build(),
            emit_relocations: cfg!(debug_assertions),
            inject_checks: None,
        }
    }
}

impl LayoutConfig {
    /// Set the guard size
    #[must_use]
    pub const fn with_guard_bytes(mut self, guard_bytes: u64) -> Self {
        self.guard_bytes = guard_bytes;
        self
    }

    /// Replace the fallback table
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: FallbackTable) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Pick the runtime bounds-check strategy
    #[must_use]
    pub const fn with_bounds_check(mut self, policy: BoundsCheckPolicy) -> Self {
        self.bounds_check = policy;
        self
    }

    /// Toggle relocation tables
    #[must_use]
    pub const fn with_relocations(mut self, emit: bool) -> Self {
        self.emit_relocations = emit;
        self
    }

    /// Inject runtime guards instead of rejecting unproven accesses
    #[must_use]
    pub const fn with_injected_checks(mut self, scratch: ScratchLocals) -> Self {
        self.inject_checks = Some(scratch);
        self
    }

    /// Reject self-contradicting settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.guard_bytes % GUARD_GRANULE != 0 {
            return Err(ConfigError::UnalignedGuard(self.guard_bytes));
        }

        if self.fallbacks.overflowed() {
            return Err(ConfigError::TooManyFallbacks);
        }
        let rules = self.fallbacks.rules();
        for (i, rule) in rules.iter().enumerate() {
            if rule.from == rule.to {
                return Err(ConfigError::SelfFallback(rule.from));
            }
            if rules.iter().take(i).any(|earlier| earlier == rule) {
                return Err(ConfigError::DuplicateFallback { from: rule.from, to: rule.to });
            }
        }

        if let Some(scratch) = self.inject_checks {
            let locals = [scratch.address, scratch.i32, scratch.i64, scratch.f32, scratch.f64, scratch.v128];
            for (i, local) in locals.iter().enumerate() {
                if locals.iter().take(i).any(|earlier| earlier == local) {
                    return Err(ConfigError::ScratchCollision(*local));
                }
            }
        }
        Ok(())
    }

    /// Decode a configuration from postcard bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        postcard::from_bytes(bytes).map_err(|_| ConfigError::Malformed)
    }

    /// Encode the configuration with postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Malformed)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Guard size breaks the guard granule
    #[error("guard of {0} bytes is not a multiple of {}", GUARD_GRANULE)]
    UnalignedGuard(u64),
    /// A region kind falls back to itself
    #[error("{0} falls back to itself")]
    SelfFallback(RegionKind),
    /// The same rule appears twice
    #[error("fallback {from} -> {to} is listed twice")]
    DuplicateFallback {
        /// Source kind
        from: RegionKind,
        /// Target kind
        to: RegionKind,
    },
    /// Rules were dropped from a full fallback table
    #[error("more than {} fallback rules", MAX_FALLBACKS)]
    TooManyFallbacks,
    /// Two scratch roles share one local
    #[error("scratch local {0} is used for two roles")]
    ScratchCollision(u32),
    /// Encoded configuration could not be decoded
    #[error("malformed configuration bytes")]
    Malformed,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = LayoutConfig::default();
        assert_eq!(config.guard_bytes, 4096);
        assert_eq!(config.fallbacks.rules().len(), 3);
        assert_eq!(config.bounds_check, BoundsCheckPolicy::for_build());
        assert_eq!(config.emit_relocations, cfg!(debug_assertions));
        assert_eq!(config.inject_checks, None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn contradictory_fallbacks_are_rejected() {
        let looping = LayoutConfig::default().with_fallbacks(FallbackTable::none().with(RegionKind::Main, RegionKind::Main));
        assert_eq!(looping.validate(), Err(ConfigError::SelfFallback(RegionKind::Main)));

        let twice = LayoutConfig::default().with_fallbacks(
            FallbackTable::none()
                .with(RegionKind::Video, RegionKind::Main)
                .with(RegionKind::Video, RegionKind::Main),
        );
        assert_eq!(
            twice.validate(),
            Err(ConfigError::DuplicateFallback { from: RegionKind::Video, to: RegionKind::Main })
        );

        let two_targets = LayoutConfig::default().with_fallbacks(
            FallbackTable::none()
                .with(RegionKind::Scratchpad, RegionKind::Video)
                .with(RegionKind::Scratchpad, RegionKind::Main),
        );
        assert_eq!(two_targets.validate(), Ok(()));

        let kinds = [RegionKind::Video, RegionKind::Audio, RegionKind::Scratchpad, RegionKind::Io];
        let mut crowded = FallbackTable::none();
        for from in kinds {
            for to in [RegionKind::Main, RegionKind::Video, RegionKind::Audio] {
                if from != to {
                    crowded = crowded.with(from, to);
                }
            }
        }
        assert_eq!(
            LayoutConfig::default().with_fallbacks(crowded).validate(),
            Err(ConfigError::TooManyFallbacks)
        );
    }

    #[test]
    fn guard_and_scratch_checks() {
        assert_eq!(
            LayoutConfig::default().with_guard_bytes(100).validate(),
            Err(ConfigError::UnalignedGuard(100))
        );
        assert_eq!(LayoutConfig::default().with_guard_bytes(0).validate(), Ok(()));

        let mut scratch = ScratchLocals::contiguous(10);
        assert_eq!(LayoutConfig::default().with_injected_checks(scratch).validate(), Ok(()));
        scratch.f64 = scratch.address;
        assert_eq!(
            LayoutConfig::default().with_injected_checks(scratch).validate(),
            Err(ConfigError::ScratchCollision(10))
        );
    }

    #[test]
    fn survives_postcard() {
        let config = LayoutConfig::default()
            .with_bounds_check(BoundsCheckPolicy::NoOp)
            .with_injected_checks(ScratchLocals::contiguous(4));
        let bytes = config.to_bytes().unwrap();
        assert_eq!(LayoutConfig::from_bytes(&bytes).unwrap(), config);
        assert_eq!(LayoutConfig::from_bytes(&[0xFF]), Err(ConfigError::Malformed));
    }
}
