//! Memory Safety Validator
//!
//! Two halves guard every component's memory accesses:
//!
//! - **Static**: [`analyze`] proves, per access, that the address stays
//!   inside the component's own linear memory. Unproven accesses are
//!   reported in a [`ValidationReport`] and either reject the component or
//!   get an injected runtime guard during rebasing.
//! - **Runtime**: [`BoundsCheckPolicy`] checks accesses against segment and
//!   shared-region bounds in debug builds and compiles to nothing in release.
//!
//! # Failure Semantics
//!
//! - Static rejection fails the whole layout attempt for that component
//! - A failed runtime check traps at once, naming the address and owner

#![deny(missing_docs)]

use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::rebase::Instruction;

pub mod analysis;
pub mod bounds;

pub use analysis::{AccessPattern, AccessRecord, Address, analyze};
pub use bounds::{AccessKind, BoundsCheck, BoundsCheckPolicy, NoOpCheck, RuntimeCheck};

/// Why an access was not proven bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationReason {
    /// Dynamic address the analysis does not recognise
    UnboundedDynamic,
    /// Constant address past the end of memory
    ConstantOutOfRange {
        /// Highest byte touched, plus one
        end: u64,
    },
    /// Recognised bound that is still larger than memory
    BoundTooWide {
        /// Highest byte the bound allows, plus one
        end: u64,
    },
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundedDynamic => f.write_str("dynamic address is not bounded"),
            Self::ConstantOutOfRange { end } => write!(f, "constant access ends at {end:#x}, past memory end"),
            Self::BoundTooWide { end } => write!(f, "bounded access may reach {end:#x}, past memory end"),
        }
    }
}

/// One rejected access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    /// Position of the instruction in the stream
    pub index: usize,
    /// Static offset of the access
    pub offset: u64,
    /// Why it was rejected
    pub reason: ViolationReason,
}

/// Outcome of validating one component
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether every access is proven bounded
    pub passed: bool,
    /// Rejected accesses, in stream order
    pub violations: Vec<Violation>,
}

impl AccessPattern {
    /// Turn the analysis into a pass/fail report
    pub fn report(&self) -> ValidationReport {
        let memory_size = self.memory_size();
        let violations: Vec<Violation> = self
            .unbounded()
            .map(|access| {
                let reason = match (access.address, access.max_end()) {
                    (Address::Constant(_), Some(end)) => ViolationReason::ConstantOutOfRange { end },
                    (Address::AtMost(_), Some(end)) => ViolationReason::BoundTooWide { end },
                    _ => ViolationReason::UnboundedDynamic,
                };
                Violation { index: access.index, offset: access.memarg.offset, reason }
            })
            .collect();

        if !violations.is_empty() {
            debug_print!(
                DEBUG,
                "{} of {} access(es) unproven against {:#x} bytes",
                violations.len(),
                self.accesses().len(),
                memory_size
            );
        }
        ValidationReport { passed: violations.is_empty(), violations }
    }
}

/// Analyze and report in one step
pub fn validate(instructions: &[Instruction], memory_size: u64) -> ValidationReport {
    analyze(instructions, memory_size).report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebase::MemoryOp;
    use Instruction::*;

    #[test]
    fn bounded_component_passes() {
        let code = [I32Const(0x40), Instruction::memory(MemoryOp::I32Load, 0), Drop];
        let report = validate(&code, 0x1000);
        assert!(report.passed);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn each_violation_names_index_offset_and_reason() {
        let code = [
            LocalGet(0),
            Instruction::memory(MemoryOp::I32Load, 8),
            I32Const(0xFFC),
            Instruction::memory(MemoryOp::I64Load, 0),
            LocalGet(1),
            I32Const(0x1FFF),
            I32And,
            Instruction::memory(MemoryOp::I32Load8U, 0),
        ];
        let report = validate(&code, 0x1000);
        assert!(!report.passed);
        assert_eq!(
            report.violations,
            [
                Violation { index: 1, offset: 8, reason: ViolationReason::UnboundedDynamic },
                Violation { index: 3, offset: 0, reason: ViolationReason::ConstantOutOfRange { end: 0x1004 } },
                Violation { index: 7, offset: 0, reason: ViolationReason::BoundTooWide { end: 0x2000 } },
            ]
        );
    }
}
