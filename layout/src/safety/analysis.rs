//! Static Access Analysis
//!
//! Abstract interpretation of a component's operand stack and locals. Every
//! value is tracked as a constant, an inclusive upper bound, a comparison
//! against a constant, or unknown. The recognised idioms are:
//!
//! - `i32.const` addresses
//! - `i32.and` with a constant mask
//! - `i32.add` of two bounded values
//! - `select` clamps (`x < n ? x : n`, in either operand order)
//! - `if unreachable end` guards after a comparison against a constant
//!
//! Control flow is followed conservatively: locals written inside a loop
//! lose their facts at the loop head, and facts at the end of a block are
//! joined over every path that reaches it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::rebase::{Instruction, MemArg, MemoryOp};

const U32_MAX: u64 = u32::MAX as u64;

/// What the analysis knows about an access's dynamic address operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Compile-time constant
    Constant(u64),
    /// Dynamic, but never above the bound
    AtMost(u64),
    /// Not recognised
    Unknown,
    /// Instruction can never execute
    Dead,
}

/// One memory access found in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessRecord {
    /// Position in the instruction stream
    pub index: usize,
    /// Load or store variant
    pub op: MemoryOp,
    /// Static immediate
    pub memarg: MemArg,
    /// Dynamic address operand
    pub address: Address,
}

impl AccessRecord {
    /// One past the highest byte the access can touch, `None` if unknown
    pub fn max_end(&self) -> Option<u64> {
        let base = match self.address {
            Address::Constant(addr) | Address::AtMost(addr) => addr,
            Address::Dead => 0,
            Address::Unknown => return None,
        };
        base.checked_add(self.memarg.offset)?.checked_add(self.op.width())
    }

    /// Whether the access provably stays inside `[0, memory_size)`
    pub fn is_bounded(&self, memory_size: u64) -> bool {
        self.address == Address::Dead || self.max_end().is_some_and(|end| end <= memory_size)
    }
}

/// Per-access boundedness of one component's instruction stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPattern {
    memory_size: u64,
    accesses: Vec<AccessRecord>,
}

impl AccessPattern {
    /// Size of the linear memory the accesses were checked against
    pub const fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Every access, in stream order
    pub fn accesses(&self) -> &[AccessRecord] {
        &self.accesses
    }

    /// Access at an instruction index
    pub fn access_at(&self, index: usize) -> Option<&AccessRecord> {
        self.accesses
            .binary_search_by_key(&index, |a| a.index)
            .ok()
            .and_then(|at| self.accesses.get(at))
    }

    /// Whether the instruction at `index` is a proven-bounded access
    pub fn is_bounded(&self, index: usize) -> bool {
        self.access_at(index).is_some_and(|a| a.is_bounded(self.memory_size))
    }

    /// Accesses that are not proven bounded
    pub fn unbounded(&self) -> impl Iterator<Item = &AccessRecord> {
        self.accesses.iter().filter(|a| !a.is_bounded(self.memory_size))
    }

    /// Whether every access is proven bounded
    pub fn all_bounded(&self) -> bool {
        self.unbounded().next().is_none()
    }
}

/// Analyze the accesses of a component whose linear memory is
/// `memory_size` bytes, as seen before rebasing.
pub fn analyze(instructions: &[Instruction], memory_size: u64) -> AccessPattern {
    let mut state = State::default();
    let mut accesses = Vec::new();
    let mut i = 0;

    while let Some(instruction) = instructions.get(i) {
        match *instruction {
            Instruction::I32Const(v) => state.push(Value::Const(u64::from(v as u32))),
            Instruction::I64Const(v) => state.push(Value::Const(v as u64)),
            Instruction::LocalGet(local) => {
                let value = state.locals.get(&local).copied().unwrap_or(Value::Unknown);
                state.stack.push(Slot { value, local: Some(local) });
            }
            Instruction::LocalSet(local) => {
                let slot = state.pop();
                state.assign(local, slot.value);
            }
            Instruction::LocalTee(local) => {
                let slot = state.pop();
                state.assign(local, slot.value);
                state.stack.push(Slot { value: slot.value, local: Some(local) });
            }
            Instruction::I32Add => {
                let (a, b) = (state.pop(), state.pop());
                state.push(add(a.value, b.value));
            }
            Instruction::I32And => {
                let (a, b) = (state.pop(), state.pop());
                state.push(and(a.value, b.value));
            }
            Instruction::I32LtU => state.compare(Cmp::LtU),
            Instruction::I32GtU => state.compare(Cmp::GtU),
            Instruction::I32GeU => state.compare(Cmp::GeU),
            Instruction::Select => {
                let cond = state.pop();
                let if_false = state.pop();
                let if_true = state.pop();
                state.push(select(if_true, if_false, cond.value));
            }
            Instruction::If => {
                let cond = state.pop();
                let guard = matches!(
                    (instructions.get(i + 1), instructions.get(i + 2)),
                    (Some(Instruction::Unreachable), Some(Instruction::End))
                );
                if guard && state.live {
                    if let Value::Cond(cond) = cond.value {
                        state.assume(cond, false);
                    }
                    i += 3;
                    continue;
                }
                state.open(FrameKind::If);
            }
            Instruction::Block => state.open(FrameKind::Block),
            Instruction::Loop => {
                if state.live {
                    for local in written_in_loop(instructions, i) {
                        state.assign(local, Value::Unknown);
                    }
                }
                state.open(FrameKind::Loop);
            }
            Instruction::Else => state.otherwise(),
            Instruction::End => state.close(),
            Instruction::Br(depth) => {
                state.branch(depth);
                state.live = false;
            }
            Instruction::BrIf(depth) => {
                state.pop();
                state.branch(depth);
            }
            Instruction::Unreachable => state.live = false,
            Instruction::Memory { op, memarg } => {
                if op.is_store() {
                    state.pop();
                }
                let addr = state.pop();
                let address = if !state.live {
                    Address::Dead
                } else {
                    match addr.value {
                        Value::Const(c) => Address::Constant(c),
                        Value::AtMost(ub) => Address::AtMost(ub),
                        Value::Cond(_) => Address::AtMost(1),
                        Value::Unknown => Address::Unknown,
                    }
                };
                accesses.push(AccessRecord { index: i, op, memarg, address });
                if !op.is_store() {
                    state.push(Value::Unknown);
                }
            }
            other => {
                let (pops, pushes) = other.stack_effect();
                for _ in 0..pops {
                    state.pop();
                }
                for _ in 0..pushes {
                    state.push(Value::Unknown);
                }
            }
        }
        i += 1;
    }

    let pattern = AccessPattern { memory_size, accesses };
    debug_print!(
        TRACE,
        "analyzed {} instruction(s): {} access(es), {} unbounded",
        instructions.len(),
        pattern.accesses.len(),
        pattern.unbounded().count()
    );
    pattern
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    LtU,
    GtU,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cond {
    local: u32,
    cmp: Cmp,
    bound: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Const(u64),
    AtMost(u64),
    Cond(Cond),
    Unknown,
}

impl Value {
    const fn upper(self) -> Option<u64> {
        match self {
            Self::Const(c) => Some(c),
            Self::AtMost(ub) => Some(ub),
            Self::Cond(_) => Some(1),
            Self::Unknown => None,
        }
    }

    fn join(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        match (self.upper(), other.upper()) {
            (Some(a), Some(b)) => Self::AtMost(a.max(b)),
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: Value,
    /// Local the value was read from, while that local is unchanged
    local: Option<u32>,
}

type Locals = BTreeMap<u32, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    height: usize,
    entry: Locals,
    exits: Option<Locals>,
    dead: bool,
}

#[derive(Debug)]
struct State {
    stack: Vec<Slot>,
    locals: Locals,
    frames: Vec<Frame>,
    live: bool,
}

impl Default for State {
    fn default() -> Self {
        Self { stack: Vec::new(), locals: Locals::new(), frames: Vec::new(), live: true }
    }
}

impl State {
    fn push(&mut self, value: Value) {
        self.stack.push(Slot { value, local: None });
    }

    /// Malformed or dead-code underflow yields an unknown operand
    fn pop(&mut self) -> Slot {
        self.stack.pop().unwrap_or(Slot { value: Value::Unknown, local: None })
    }

    fn assign(&mut self, local: u32, value: Value) {
        // comparisons against the old value no longer describe the local
        let stale = |v: &mut Value| {
            if matches!(*v, Value::Cond(c) if c.local == local) {
                *v = Value::AtMost(1);
            }
        };
        for slot in &mut self.stack {
            if slot.local == Some(local) {
                slot.local = None;
            }
            stale(&mut slot.value);
        }
        self.locals.values_mut().for_each(stale);
        match value {
            Value::Unknown => self.locals.remove(&local),
            value => self.locals.insert(local, value),
        };
    }

    fn compare(&mut self, cmp: Cmp) {
        let rhs = self.pop();
        let lhs = self.pop();
        let value = match (lhs.local, rhs.value) {
            (Some(local), Value::Const(bound)) => Value::Cond(Cond { local, cmp, bound }),
            _ => Value::AtMost(1),
        };
        self.push(value);
    }

    /// Narrow every copy of the compared local to the branch where
    /// `cond` evaluates to `truth`
    fn assume(&mut self, cond: Cond, truth: bool) {
        let Some(limit) = limit_under(cond, truth) else {
            return;
        };
        let narrowed = |value: Value| match value.upper() {
            Some(ub) if ub <= limit => value,
            _ => Value::AtMost(limit),
        };
        let current = self.locals.get(&cond.local).copied().unwrap_or(Value::Unknown);
        self.locals.insert(cond.local, narrowed(current));
        for slot in &mut self.stack {
            if slot.local == Some(cond.local) {
                slot.value = narrowed(slot.value);
            }
        }
    }

    fn open(&mut self, kind: FrameKind) {
        self.frames.push(Frame {
            kind,
            height: self.stack.len(),
            entry: self.locals.clone(),
            exits: None,
            dead: !self.live,
        });
    }

    fn otherwise(&mut self) {
        let live = self.live;
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        if live {
            frame.exits = Some(join_paths(frame.exits.take(), &self.locals));
        }
        self.locals = frame.entry.clone();
        self.stack.truncate(frame.height);
        self.live = !frame.dead;
        frame.kind = FrameKind::Else;
    }

    fn close(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let mut reached = frame.exits;
        if self.live {
            reached = Some(join_paths(reached, &self.locals));
        }
        if frame.kind == FrameKind::If && !frame.dead {
            reached = Some(join_paths(reached, &frame.entry));
        }

        // block results are opaque
        if self.live {
            for slot in self.stack.iter_mut().skip(frame.height) {
                *slot = Slot { value: Value::Unknown, local: None };
            }
        } else {
            self.stack.truncate(frame.height);
        }

        self.live = reached.is_some() && !frame.dead;
        self.locals = reached.unwrap_or_default();
    }

    fn branch(&mut self, depth: u32) {
        if !self.live {
            return;
        }
        let target = self
            .frames
            .len()
            .checked_sub(1)
            .and_then(|top| top.checked_sub(depth as usize));
        let Some(frame) = target.and_then(|at| self.frames.get_mut(at)) else {
            return;
        };
        if frame.kind != FrameKind::Loop {
            frame.exits = Some(join_paths(frame.exits.take(), &self.locals));
        }
    }
}

fn join_paths(seen: Option<Locals>, path: &Locals) -> Locals {
    let Some(seen) = seen else {
        return path.clone();
    };
    seen.into_iter()
        .filter_map(|(local, value)| {
            let other = path.get(&local)?;
            match value.join(*other) {
                Value::Unknown => None,
                joined => Some((local, joined)),
            }
        })
        .collect()
}

/// Inclusive upper bound of the compared local when `cond == truth`
fn limit_under(cond: Cond, truth: bool) -> Option<u64> {
    match (cond.cmp, truth) {
        (Cmp::LtU, true) | (Cmp::GeU, false) => cond.bound.checked_sub(1),
        (Cmp::GtU, false) => Some(cond.bound),
        _ => None,
    }
}

fn add(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Const(x), Value::Const(y)) => Value::Const(x.wrapping_add(y) & U32_MAX),
        _ => match (a.upper(), b.upper()) {
            (Some(x), Some(y)) => match x.checked_add(y) {
                Some(sum) if sum <= U32_MAX => Value::AtMost(sum),
                _ => Value::Unknown,
            },
            _ => Value::Unknown,
        },
    }
}

fn and(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Const(x), Value::Const(y)) => Value::Const(x & y),
        _ => match (a.upper(), b.upper()) {
            (Some(x), Some(y)) => Value::AtMost(x.min(y)),
            (Some(x), None) | (None, Some(x)) => Value::AtMost(x),
            (None, None) => Value::Unknown,
        },
    }
}

fn select(if_true: Slot, if_false: Slot, cond: Value) -> Value {
    match cond {
        Value::Const(0) => if_false.value,
        Value::Const(_) => if_true.value,
        Value::Cond(cond) => refine(if_true, cond, true).join(refine(if_false, cond, false)),
        _ => if_true.value.join(if_false.value),
    }
}

fn refine(slot: Slot, cond: Cond, truth: bool) -> Value {
    if slot.local != Some(cond.local) {
        return slot.value;
    }
    match (limit_under(cond, truth), slot.value.upper()) {
        (Some(limit), Some(ub)) if ub <= limit => slot.value,
        (Some(limit), _) => Value::AtMost(limit),
        (None, _) => slot.value,
    }
}

/// Locals written between a `loop` at `start` and its matching `end`
fn written_in_loop(instructions: &[Instruction], start: usize) -> Vec<u32> {
    let mut written = Vec::new();
    let mut depth = 0usize;
    for instruction in instructions.iter().skip(start + 1) {
        match instruction {
            Instruction::Block | Instruction::Loop | Instruction::If => depth += 1,
            Instruction::End if depth == 0 => break,
            Instruction::End => depth -= 1,
            Instruction::LocalSet(local) | Instruction::LocalTee(local) => {
                if !written.contains(local) {
                    written.push(*local);
                }
            }
            _ => {}
        }
    }
    written
}
