//! Linear-Memory Instruction Model
//!
//! The subset of WebAssembly instructions the engine needs to see. The
//! decoder hands over a flat stream; anything that neither touches memory
//! nor matters to the bounds analysis arrives as [`Instruction::Other`]
//! with its stack effect.

use serde::{Deserialize, Serialize};

/// Load/store opcodes, all widths and signedness variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum MemoryOp {
    I32Load = 0x28,
    I64Load = 0x29,
    F32Load = 0x2A,
    F64Load = 0x2B,
    I32Load8S = 0x2C,
    I32Load8U = 0x2D,
    I32Load16S = 0x2E,
    I32Load16U = 0x2F,
    I64Load8S = 0x30,
    I64Load8U = 0x31,
    I64Load16S = 0x32,
    I64Load16U = 0x33,
    I64Load32S = 0x34,
    I64Load32U = 0x35,
    I32Store = 0x36,
    I64Store = 0x37,
    F32Store = 0x38,
    F64Store = 0x39,
    I32Store8 = 0x3A,
    I32Store16 = 0x3B,
    I64Store8 = 0x3C,
    I64Store16 = 0x3D,
    I64Store32 = 0x3E,
    /// `0xFD 0x00`
    V128Load = 0xFD00,
    /// `0xFD 0x0B`
    V128Store = 0xFD0B,
}

/// Type of the value a store consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl MemoryOp {
    /// Every memory opcode, in opcode order
    pub const ALL: [Self; 25] = [
        Self::I32Load,
        Self::I64Load,
        Self::F32Load,
        Self::F64Load,
        Self::I32Load8S,
        Self::I32Load8U,
        Self::I32Load16S,
        Self::I32Load16U,
        Self::I64Load8S,
        Self::I64Load8U,
        Self::I64Load16S,
        Self::I64Load16U,
        Self::I64Load32S,
        Self::I64Load32U,
        Self::I32Store,
        Self::I64Store,
        Self::F32Store,
        Self::F64Store,
        Self::I32Store8,
        Self::I32Store16,
        Self::I64Store8,
        Self::I64Store16,
        Self::I64Store32,
        Self::V128Load,
        Self::V128Store,
    ];

    /// Opcode, with the `0xFD` prefix in the high byte for SIMD ops
    pub const fn opcode(self) -> u16 {
        self as u16
    }

    /// Decode an opcode
    pub fn from_opcode(opcode: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.opcode() == opcode)
    }

    /// Bytes touched by one access
    pub const fn width(self) -> u64 {
        match self {
            Self::I32Load8S | Self::I32Load8U | Self::I64Load8S | Self::I64Load8U => 1,
            Self::I32Store8 | Self::I64Store8 => 1,
            Self::I32Load16S | Self::I32Load16U | Self::I64Load16S | Self::I64Load16U => 2,
            Self::I32Store16 | Self::I64Store16 => 2,
            Self::I32Load | Self::F32Load | Self::I64Load32S | Self::I64Load32U => 4,
            Self::I32Store | Self::F32Store | Self::I64Store32 => 4,
            Self::I64Load | Self::F64Load | Self::I64Store | Self::F64Store => 8,
            Self::V128Load | Self::V128Store => 16,
        }
    }

    /// Whether the op writes memory
    pub const fn is_store(self) -> bool {
        matches!(
            self,
            Self::I32Store
                | Self::I64Store
                | Self::F32Store
                | Self::F64Store
                | Self::I32Store8
                | Self::I32Store16
                | Self::I64Store8
                | Self::I64Store16
                | Self::I64Store32
                | Self::V128Store
        )
    }

    /// Log2 of the natural alignment
    pub const fn natural_align(self) -> u32 {
        self.width().trailing_zeros()
    }

    /// Type of the stored value, `None` for loads
    pub const fn stored_type(self) -> Option<ValueType> {
        match self {
            Self::I32Store | Self::I32Store8 | Self::I32Store16 => Some(ValueType::I32),
            Self::I64Store | Self::I64Store8 | Self::I64Store16 | Self::I64Store32 => Some(ValueType::I64),
            Self::F32Store => Some(ValueType::F32),
            Self::F64Store => Some(ValueType::F64),
            Self::V128Store => Some(ValueType::V128),
            _ => None,
        }
    }
}

/// Static immediate of a memory instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemArg {
    /// Log2 of the alignment hint
    pub align: u32,
    /// Constant byte offset added to the dynamic address
    pub offset: u64,
}

impl MemArg {
    /// Memarg with the op's natural alignment
    pub const fn natural(op: MemoryOp, offset: u64) -> Self {
        Self { align: op.natural_align(), offset }
    }

    /// Alignment hint in bytes, `None` if it cannot be represented
    pub const fn align_bytes(&self) -> Option<u64> {
        1u64.checked_shl(self.align)
    }
}

/// One instruction of a component's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Instruction {
    I32Const(i32),
    I64Const(i64),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    I32Add,
    I32And,
    I32LtU,
    I32GtU,
    I32GeU,
    Select,
    Drop,
    Block,
    Loop,
    If,
    Else,
    End,
    Br(u32),
    BrIf(u32),
    Unreachable,
    Memory { op: MemoryOp, memarg: MemArg },
    MemorySize,
    MemoryGrow,
    /// Anything else, described by how many operands it pops and pushes
    Other { pops: u8, pushes: u8 },
}

impl Instruction {
    /// Memory access with natural alignment
    pub const fn memory(op: MemoryOp, offset: u64) -> Self {
        Self::Memory { op, memarg: MemArg::natural(op, offset) }
    }

    /// Operands popped and results pushed
    pub const fn stack_effect(&self) -> (usize, usize) {
        match self {
            Self::I32Const(_) | Self::I64Const(_) | Self::LocalGet(_) | Self::GlobalGet(_) => (0, 1),
            Self::LocalSet(_) | Self::Drop | Self::If | Self::BrIf(_) => (1, 0),
            Self::LocalTee(_) | Self::MemoryGrow => (1, 1),
            Self::I32Add | Self::I32And | Self::I32LtU | Self::I32GtU | Self::I32GeU => (2, 1),
            Self::Select => (3, 1),
            Self::Block | Self::Loop | Self::Else | Self::End | Self::Br(_) | Self::Unreachable => (0, 0),
            Self::Memory { op, .. } if op.is_store() => (2, 0),
            Self::Memory { .. } => (1, 1),
            Self::MemorySize => (0, 1),
            Self::Other { pops, pushes } => (*pops as usize, *pushes as usize),
        }
    }

    /// The access this instruction performs, if any
    pub const fn memory_access(&self) -> Option<(MemoryOp, MemArg)> {
        match self {
            Self::Memory { op, memarg } => Some((*op, *memarg)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn opcodes_decode() {
        for op in MemoryOp::ALL {
            assert_eq!(MemoryOp::from_opcode(op.opcode()), Some(op));
        }
        assert_eq!(MemoryOp::from_opcode(0x3F), None);
    }

    #[test]
    fn widths_match_the_value_types() {
        assert_eq!(MemoryOp::I64Load32U.width(), 4);
        assert_eq!(MemoryOp::I32Store16.width(), 2);
        assert_eq!(MemoryOp::V128Load.natural_align(), 4);
        assert_eq!(MemoryOp::F64Store.stored_type(), Some(ValueType::F64));
        assert_eq!(MemoryOp::I64Load8S.stored_type(), None);
    }

    #[test]
    fn stores_pop_address_and_value() {
        assert_eq!(Instruction::memory(MemoryOp::I32Store, 0).stack_effect(), (2, 0));
        assert_eq!(Instruction::memory(MemoryOp::I32Load, 0).stack_effect(), (1, 1));
        assert_eq!(Instruction::Other { pops: 2, pushes: 1 }.stack_effect(), (2, 1));
    }

    #[test]
    fn oversized_alignment_hint_is_unrepresentable() {
        assert_eq!(MemArg { align: 3, offset: 0 }.align_bytes(), Some(8));
        assert_eq!(MemArg { align: 64, offset: 0 }.align_bytes(), None);
    }
}
