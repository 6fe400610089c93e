//! Memory Rebasing Engine
//!
//! Rewrites a component's memory instructions so that code compiled for a
//! linear memory starting at `old_base` (normally 0) addresses its assigned
//! [`MemorySegment`] instead. Every load and store gets the segment delta
//! added to its static offset; dynamic address operands are left alone.
//!
//! # Safety
//!
//! Leaving a dynamic address alone is only sound when the address is known
//! to stay inside the component's own memory. Each access must therefore be
//! proven bounded by [`crate::safety::analyze`], or be preceded by an
//! injected guard that traps on an out-of-range address:
//!
//! ```text
//! load:   local.tee A ; i32.const LIMIT ; i32.gt_u ; if ; unreachable ; end ; local.get A ; <load>
//! store:  local.set V ; local.tee A ; i32.const LIMIT ; i32.gt_u ; if ; unreachable ; end ;
//!         local.get A ; local.get V ; <store>
//! ```
//!
//! `LIMIT` is the highest address for which the access still ends inside
//! the component's memory.

#![deny(missing_docs)]

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::memory::{ComponentId, MemorySegment};
use crate::safety::{AccessPattern, AccessRecord, Address, analyze};

pub mod instruction;

pub use instruction::{Instruction, MemArg, MemoryOp, ValueType};

/// Addressable bytes of a 32-bit linear memory
pub const MEMORY32_LIMIT: u64 = 1 << 32;

/// Number of scratch locals [`ScratchLocals::contiguous`] claims
pub const SCRATCH_LOCALS: u32 = 6;

/// Rebasing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RebaseError {
    /// Dynamic address not proven bounded and no guard requested
    #[error("instruction {index}: dynamic address is not proven bounded")]
    UnboundedDynamicAccess {
        /// Instruction position
        index: usize,
    },
    /// Constant access that always leaves the component's memory
    #[error("instruction {index}: constant access ends at {end:#x}, outside the component's memory")]
    OutOfBounds {
        /// Instruction position
        index: usize,
        /// One past the last byte touched
        end: u64,
    },
    /// Rewritten offset would break an aligned access
    #[error("instruction {index}: offset {offset:#x} is not {align}-byte aligned")]
    AlignmentViolation {
        /// Instruction position
        index: usize,
        /// Rewritten offset
        offset: u64,
        /// Alignment the original access had
        align: u64,
    },
    /// Rewritten access leaves the 32-bit address space
    #[error("instruction {index}: rebased address overflows")]
    AddressOverflow {
        /// Instruction position
        index: usize,
    },
    /// Segment starts below the component's original base
    #[error("segment base {base:#x} lies below original base {old_base:#x}")]
    InvalidBase {
        /// Base the component was compiled for
        old_base: u64,
        /// Assigned segment base
        base: u64,
    },
    /// Relocation table could not be encoded or decoded
    #[error("relocation table encoding failed")]
    Encoding,
}

/// Locals reserved by the caller for injected guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScratchLocals {
    /// i32 local holding the address
    pub address: u32,
    /// i32 local holding a stored i32 value
    pub i32: u32,
    /// i64 local holding a stored i64 value
    pub i64: u32,
    /// f32 local holding a stored f32 value
    pub f32: u32,
    /// f64 local holding a stored f64 value
    pub f64: u32,
    /// v128 local holding a stored v128 value
    pub v128: u32,
}

impl ScratchLocals {
    /// Six consecutive locals starting at `first`, typed
    /// `i32, i32, i64, f32, f64, v128`
    pub const fn contiguous(first: u32) -> Self {
        Self {
            address: first,
            i32: first + 1,
            i64: first + 2,
            f32: first + 3,
            f64: first + 4,
            v128: first + 5,
        }
    }

    const fn for_value(&self, ty: ValueType) -> u32 {
        match ty {
            ValueType::I32 => self.i32,
            ValueType::I64 => self.i64,
            ValueType::F32 => self.f32,
            ValueType::F64 => self.f64,
            ValueType::V128 => self.v128,
        }
    }
}

/// One rewritten memory instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelocationEntry {
    /// Position in the rewritten stream
    pub index: u32,
    /// Position in the original stream
    pub source_index: u32,
    /// Load or store variant
    pub op: MemoryOp,
    /// Bytes accessed
    pub width: u8,
    /// Static offset before rebasing
    pub original_offset: u64,
    /// Static offset after rebasing
    pub new_offset: u64,
}

/// Relocations of one component, for debuggers and symbolication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationTable {
    /// Rebased component
    pub component: ComponentId,
    /// Base the component was moved to
    pub base: u64,
    /// Rewritten instructions, in stream order
    pub entries: Vec<RelocationEntry>,
}

impl RelocationTable {
    /// Empty table for a component
    pub const fn new(component: ComponentId, base: u64) -> Self {
        Self { component, base, entries: Vec::new() }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries were recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a position in the rewritten stream
    pub fn entry_at(&self, index: u32) -> Option<&RelocationEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    /// Encode with postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, RebaseError> {
        postcard::to_allocvec(self).map_err(|_| RebaseError::Encoding)
    }

    /// Decode from postcard
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RebaseError> {
        postcard::from_bytes(bytes).map_err(|_| RebaseError::Encoding)
    }
}

/// A component's instruction stream after rebasing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebasedComponent {
    /// Owner of the segment
    pub component: ComponentId,
    /// Rewritten instructions
    pub instructions: Vec<Instruction>,
    /// Relocations, empty when not requested
    pub relocations: RelocationTable,
    /// Number of injected guard sequences
    pub injected_guards: usize,
}

/// Rebasing configuration for one segment
#[derive(Debug, Clone, Copy)]
pub struct Rebaser<'s> {
    segment: &'s MemorySegment,
    old_base: u64,
    scratch: Option<ScratchLocals>,
    emit_relocations: bool,
}

impl<'s> Rebaser<'s> {
    /// Rebase from address 0, reject unproven accesses, record relocations
    pub const fn new(segment: &'s MemorySegment) -> Self {
        Self { segment, old_base: 0, scratch: None, emit_relocations: true }
    }

    /// Base the component was compiled for
    #[must_use]
    pub const fn with_old_base(mut self, old_base: u64) -> Self {
        self.old_base = old_base;
        self
    }

    /// Guard unproven accesses using the given scratch locals
    #[must_use]
    pub const fn inject_checks(mut self, scratch: ScratchLocals) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// Whether to fill the relocation table
    #[must_use]
    pub const fn emit_relocations(mut self, emit: bool) -> Self {
        self.emit_relocations = emit;
        self
    }

    /// Analyze and rebase
    pub fn rebase(&self, instructions: &[Instruction]) -> Result<RebasedComponent, RebaseError> {
        let pattern = analyze(instructions, self.memory_size());
        self.rebase_with(instructions, &pattern)
    }

    /// Rebase using an analysis computed earlier for the same stream
    pub fn rebase_with(
        &self,
        instructions: &[Instruction],
        pattern: &AccessPattern,
    ) -> Result<RebasedComponent, RebaseError> {
        let base = self.segment.base;
        let delta = base
            .checked_sub(self.old_base)
            .ok_or(RebaseError::InvalidBase { old_base: self.old_base, base })?;
        let memory_size = self.memory_size();

        let mut out = Vec::with_capacity(instructions.len());
        let mut relocations = RelocationTable::new(self.segment.owner, base);
        let mut injected_guards = 0;

        for (index, instruction) in instructions.iter().enumerate() {
            let Instruction::Memory { op, memarg } = *instruction else {
                out.push(*instruction);
                continue;
            };

            let access = pattern.access_at(index);
            if !access.is_some_and(|a| a.is_bounded(memory_size)) {
                let Some(scratch) = self.scratch else {
                    return Err(rejection(index, access));
                };
                push_guard(&mut out, op, memarg, memory_size, &scratch);
                injected_guards += 1;
            }

            let new_offset = relocate(index, op, memarg, delta, access)?;
            if self.emit_relocations {
                relocations.entries.push(RelocationEntry {
                    index: out.len() as u32,
                    source_index: index as u32,
                    op,
                    width: op.width() as u8,
                    original_offset: memarg.offset,
                    new_offset,
                });
            }
            out.push(Instruction::Memory { op, memarg: MemArg { align: memarg.align, offset: new_offset } });
        }

        debug_print!(
            DEBUG,
            "rebased {} onto {:#x}: {} access(es), {} guard(s) injected",
            self.segment.owner,
            base,
            pattern.accesses().len(),
            injected_guards
        );
        Ok(RebasedComponent {
            component: self.segment.owner,
            instructions: out,
            relocations,
            injected_guards,
        })
    }

    const fn memory_size(&self) -> u64 {
        self.old_base.saturating_add(self.segment.size)
    }
}

/// Rebase a component compiled for `old_base` onto `segment`
pub fn rebase(
    instructions: &[Instruction],
    old_base: u64,
    segment: &MemorySegment,
) -> Result<RebasedComponent, RebaseError> {
    Rebaser::new(segment).with_old_base(old_base).rebase(instructions)
}

/// Undo [`rebase`] by subtracting the segment delta from every offset.
///
/// Injected guards are not removed, so only streams rebased without
/// injection come back unchanged.
pub fn unrebase(
    instructions: &[Instruction],
    old_base: u64,
    segment: &MemorySegment,
) -> Result<Vec<Instruction>, RebaseError> {
    let base = segment.base;
    let delta = base.checked_sub(old_base).ok_or(RebaseError::InvalidBase { old_base, base })?;
    instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| match *instruction {
            Instruction::Memory { op, memarg } => {
                let offset = memarg.offset.checked_sub(delta).ok_or(RebaseError::AddressOverflow { index })?;
                Ok(Instruction::Memory { op, memarg: MemArg { align: memarg.align, offset } })
            }
            other => Ok(other),
        })
        .collect()
}

fn rejection(index: usize, access: Option<&AccessRecord>) -> RebaseError {
    match access {
        Some(AccessRecord { address: Address::Constant(_), .. }) => RebaseError::OutOfBounds {
            index,
            end: access.and_then(AccessRecord::max_end).unwrap_or(u64::MAX),
        },
        _ => RebaseError::UnboundedDynamicAccess { index },
    }
}

fn relocate(
    index: usize,
    op: MemoryOp,
    memarg: MemArg,
    delta: u64,
    access: Option<&AccessRecord>,
) -> Result<u64, RebaseError> {
    let overflow = RebaseError::AddressOverflow { index };
    let new_offset = memarg.offset.checked_add(delta).ok_or(overflow)?;
    if new_offset >= MEMORY32_LIMIT {
        return Err(overflow);
    }
    if let Some(end) = access.and_then(AccessRecord::max_end) {
        if end.checked_add(delta).is_none_or(|end| end > MEMORY32_LIMIT) {
            return Err(overflow);
        }
    }

    if let Some(align) = memarg.align_bytes() {
        if memarg.offset % align == 0 && new_offset % align != 0 {
            debug_print!(ERROR, "rebase misaligns {:?} at instruction {}", op, index);
            return Err(RebaseError::AlignmentViolation { index, offset: new_offset, align });
        }
    }
    Ok(new_offset)
}

fn push_guard(out: &mut Vec<Instruction>, op: MemoryOp, memarg: MemArg, memory_size: u64, scratch: &ScratchLocals) {
    let reach = memarg.offset.saturating_add(op.width());
    let Some(limit) = memory_size.checked_sub(reach) else {
        // no address keeps this access inside memory
        out.push(Instruction::Unreachable);
        return;
    };
    let limit = limit.min(u64::from(u32::MAX)) as u32 as i32;

    let value = op.stored_type().map(|ty| scratch.for_value(ty));
    if let Some(value) = value {
        out.push(Instruction::LocalSet(value));
    }
    out.extend_from_slice(&[
        Instruction::LocalTee(scratch.address),
        Instruction::I32Const(limit),
        Instruction::I32GtU,
        Instruction::If,
        Instruction::Unreachable,
        Instruction::End,
        Instruction::LocalGet(scratch.address),
    ]);
    if let Some(value) = value {
        out.push(Instruction::LocalGet(value));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use proptest::prelude::*;

    use super::*;
    use crate::platform::{AccessFlags, RegionKind};
    use crate::safety::validate;
    use Instruction::*;

    fn segment(base: u64, size: u64) -> MemorySegment {
        MemorySegment {
            owner: ComponentId::new(1),
            base,
            size,
            guard: 0x1000,
            alignment: 16,
            region: RegionKind::Main,
            access: AccessFlags::RW,
        }
    }

    #[test]
    fn constant_accesses_are_shifted_by_the_base() {
        let code = [I32Const(0x10), Instruction::memory(MemoryOp::I32Load, 4), Drop];
        let rebased = rebase(&code, 0, &segment(0x10_1000, 0x8_0000)).unwrap();

        assert_eq!(rebased.instructions[1], Instruction::memory(MemoryOp::I32Load, 0x10_1004));
        assert_eq!(rebased.injected_guards, 0);
        assert_eq!(
            rebased.relocations.entries,
            [RelocationEntry {
                index: 1,
                source_index: 1,
                op: MemoryOp::I32Load,
                width: 4,
                original_offset: 4,
                new_offset: 0x10_1004,
            }]
        );
    }

    #[test]
    fn unproven_access_is_rejected() {
        let code = [LocalGet(0), Instruction::memory(MemoryOp::I64Load, 0)];
        assert_eq!(
            rebase(&code, 0, &segment(0x1000, 0x1000)),
            Err(RebaseError::UnboundedDynamicAccess { index: 1 })
        );
    }

    #[test]
    fn constant_outside_memory_is_out_of_bounds() {
        let code = [I32Const(0x2000), Instruction::memory(MemoryOp::I32Load8U, 0)];
        assert_eq!(
            rebase(&code, 0, &segment(0x1000, 0x1000)),
            Err(RebaseError::OutOfBounds { index: 1, end: 0x2001 })
        );
    }

    #[test]
    fn injected_load_guard_proves_itself() {
        let code = [LocalGet(0), Instruction::memory(MemoryOp::I32Load, 8), Drop];
        let rebased = Rebaser::new(&segment(0x4000, 0x1000))
            .inject_checks(ScratchLocals::contiguous(10))
            .rebase(&code)
            .unwrap();

        assert_eq!(rebased.injected_guards, 1);
        assert_eq!(
            &rebased.instructions[1..8],
            &[LocalTee(10), I32Const(0xFF4), I32GtU, If, Unreachable, End, LocalGet(10)]
        );
        assert_eq!(rebased.relocations.entries[0].index, 8);

        // the guarded stream, seen at its original base, is fully bounded
        let unrebased = unrebase(&rebased.instructions, 0, &segment(0x4000, 0x1000)).unwrap();
        assert!(validate(&unrebased, 0x1000).passed);
    }

    #[test]
    fn injected_store_guard_parks_the_value() {
        let code = [LocalGet(0), LocalGet(1), Instruction::memory(MemoryOp::F64Store, 0)];
        let rebased = Rebaser::new(&segment(0x4000, 0x1000))
            .inject_checks(ScratchLocals::contiguous(10))
            .rebase(&code)
            .unwrap();
        assert_eq!(rebased.instructions[2], LocalSet(14));
        assert_eq!(rebased.instructions[10], LocalGet(14));
        assert!(matches!(rebased.instructions[11], Memory { op: MemoryOp::F64Store, .. }));
    }

    #[test]
    fn rebase_never_misaligns_an_aligned_access() {
        let code = [I32Const(0), Instruction::memory(MemoryOp::V128Load, 16)];
        assert_eq!(
            rebase(&code, 0, &segment(0x1008, 0x1000)),
            Err(RebaseError::AlignmentViolation { index: 1, offset: 0x1018, align: 16 })
        );
        // an access that was unaligned to begin with is left to the runtime
        let code = [I32Const(0), Memory { op: MemoryOp::V128Load, memarg: MemArg { align: 4, offset: 4 } }];
        assert!(rebase(&code, 0, &segment(0x1008, 0x1000)).is_ok());
    }

    #[test]
    fn offsets_past_four_gigabytes_overflow() {
        let code = [I32Const(0), Instruction::memory(MemoryOp::I32Load, 0xF000)];
        assert_eq!(
            rebase(&code, 0, &segment(0xFFFF_F000, 0x1_0000)),
            Err(RebaseError::AddressOverflow { index: 1 })
        );
    }

    #[test]
    fn segment_below_old_base_is_invalid() {
        assert_eq!(
            rebase(&[], 0x2000, &segment(0x1000, 0x1000)),
            Err(RebaseError::InvalidBase { old_base: 0x2000, base: 0x1000 })
        );
    }

    #[test]
    fn relocations_can_be_suppressed() {
        let code = [I32Const(1), I32Const(0), Instruction::memory(MemoryOp::I32Store8, 0)];
        let rebased = Rebaser::new(&segment(0x1000, 0x1000)).emit_relocations(false).rebase(&code).unwrap();
        assert!(rebased.relocations.is_empty());
        assert_eq!(rebased.instructions[2], Instruction::memory(MemoryOp::I32Store8, 0x1000));
    }

    #[test]
    fn relocation_table_survives_postcard() {
        let code = [I32Const(0), Instruction::memory(MemoryOp::I64Load16S, 2)];
        let table = rebase(&code, 0, &segment(0x2000, 0x1000)).unwrap().relocations;
        let bytes = table.to_bytes().unwrap();
        assert_eq!(RelocationTable::from_bytes(&bytes).unwrap(), table);
        assert_eq!(table.entry_at(1).unwrap().new_offset, 0x2002);
        assert_eq!(RelocationTable::from_bytes(&[0xFF, 0xFF]), Err(RebaseError::Encoding));
    }

    fn bounded_stream() -> impl Strategy<Value = std::vec::Vec<Instruction>> {
        let op = prop::sample::select(MemoryOp::ALL.to_vec());
        prop::collection::vec((op, 0u64..0x100, 0i32..0x100), 0..32).prop_map(|accesses| {
            let mut code = std::vec::Vec::new();
            for (op, offset, addr) in accesses {
                let offset = offset & !(op.width() - 1);
                if op.is_store() {
                    code.push(I32Const(addr));
                    code.push(Other { pops: 0, pushes: 1 });
                    code.push(Instruction::memory(op, offset));
                } else {
                    code.push(I32Const(addr));
                    code.push(Instruction::memory(op, offset));
                    code.push(Drop);
                }
            }
            code
        })
    }

    proptest! {
        #[test]
        fn rebase_then_unrebase_is_identity(code in bounded_stream(), base in 0u64..0x1000) {
            let segment = segment(base * 16, 0x1000);
            let rebased = rebase(&code, 0, &segment).unwrap();
            prop_assert_eq!(rebased.instructions.len(), code.len());
            prop_assert_eq!(unrebase(&rebased.instructions, 0, &segment).unwrap(), code);
        }
    }
}
