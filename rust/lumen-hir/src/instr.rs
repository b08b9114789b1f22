//! Instructions.
//!
//! An [`Instr`] has a kind (opcode plus immediates), a fixed number of
//! register operands decided at construction, an optional output register
//! and a bytecode offset. Instructions that can deoptimize additionally
//! carry [`DeoptInfo`]: the registers that must be recoverable from machine
//! state, the operand blamed for a failure and a description.

use strum::Display;

use lumen_core::code::BcOffset;

use crate::block::BlockId;
use crate::frame_state::FrameState;
use crate::opcode::{InstrKind, Opcode};
use crate::register::RegId;
use crate::types::Type;

// ---------------------------------------------------------------------------
// Live register descriptions
// ---------------------------------------------------------------------------

/// Ownership of a live reference at the point it is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RefKind {
    /// Not reference counted (primitives, immortal objects).
    Uncounted,
    /// Observed only; another owner keeps it alive.
    Borrowed,
    /// Held exclusively by the compiled code.
    Owned,
}

/// Machine representation of a live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ValueKind {
    Object,
    Signed,
    Unsigned,
    Bool,
    Double,
}

impl ValueKind {
    /// The representation used for values of type `ty`.
    pub fn from_type(ty: Type) -> ValueKind {
        if ty.is_subtype_of(Type::CBOOL) && !ty.is_bottom() {
            ValueKind::Bool
        } else if ty.is_subtype_of(Type::CSIGNED) && !ty.is_bottom() {
            ValueKind::Signed
        } else if ty.is_subtype_of(Type::CUNSIGNED) && !ty.is_bottom() {
            ValueKind::Unsigned
        } else if ty.is_subtype_of(Type::CDOUBLE) && !ty.is_bottom() {
            ValueKind::Double
        } else {
            ValueKind::Object
        }
    }

    pub fn is_primitive(self) -> bool {
        self != ValueKind::Object
    }
}

/// A register that must survive past a deoptimizing instruction, with its
/// ownership and representation at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegState {
    pub reg: RegId,
    pub ref_kind: RefKind,
    pub value_kind: ValueKind,
}

impl RegState {
    pub fn new(reg: RegId, ref_kind: RefKind, value_kind: ValueKind) -> Self {
        Self {
            reg,
            ref_kind,
            value_kind,
        }
    }

    pub fn owned(reg: RegId) -> Self {
        Self::new(reg, RefKind::Owned, ValueKind::Object)
    }

    pub fn borrowed(reg: RegId) -> Self {
        Self::new(reg, RefKind::Borrowed, ValueKind::Object)
    }
}

/// Deoptimization data of a deopt-capable instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeoptInfo {
    pub live_regs: Vec<RegState>,
    pub guilty_reg: Option<RegId>,
    pub descr: Option<String>,
}

// ---------------------------------------------------------------------------
// Instr
// ---------------------------------------------------------------------------

/// One IR instruction.
#[derive(Debug, PartialEq)]
pub struct Instr {
    kind: InstrKind,
    operands: Box<[RegId]>,
    output: Option<RegId>,
    bc_offset: Option<BcOffset>,
    block: Option<BlockId>,
    frame_state: Option<Box<FrameState>>,
    deopt: Option<DeoptInfo>,
}

impl Instr {
    /// Create an unlinked instruction.
    ///
    /// # Panics
    /// Panics if the number of operands does not match the kind's arity, or
    /// if a `LoadConst` type does not denote a single value.
    pub fn new(kind: InstrKind, operands: &[RegId], output: Option<RegId>) -> Self {
        let expected = kind.operand_count();
        assert_eq!(
            operands.len(),
            expected,
            "{} takes {expected} operands, got {}",
            kind.opcode(),
            operands.len()
        );
        if let InstrKind::LoadConst { ty } = &kind {
            assert!(
                ty.is_single_value(),
                "LoadConst requires a single-value type, got {ty}"
            );
        }
        let opcode = kind.opcode();
        let deopt = opcode.has_deopt_data().then(|| DeoptInfo {
            guilty_reg: opcode.guilty_operand().map(|i| operands[i]),
            ..DeoptInfo::default()
        });
        Self {
            kind,
            operands: operands.into(),
            output,
            bc_offset: None,
            block: None,
            frame_state: None,
            deopt,
        }
    }

    pub fn kind(&self) -> &InstrKind {
        &self.kind
    }

    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode().is_terminator()
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.kind.successors()
    }

    /// Retarget successor `index`.
    ///
    /// # Panics
    /// Panics if the instruction has no such successor.
    pub fn set_successor(&mut self, index: usize, target: BlockId) {
        let opcode = self.opcode();
        let slot = self
            .kind
            .successor_mut(index)
            .unwrap_or_else(|| panic!("{opcode} has no successor {index}"));
        *slot = target;
    }

    // -- operands -----------------------------------------------------------

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// # Panics
    /// Panics if `i >= num_operands()`.
    pub fn operand(&self, i: usize) -> RegId {
        match self.operands.get(i) {
            Some(reg) => *reg,
            None => panic!(
                "operand {i} out of bounds for {} with {} operands",
                self.opcode(),
                self.operands.len()
            ),
        }
    }

    /// # Panics
    /// Panics if `i >= num_operands()`.
    pub fn set_operand(&mut self, i: usize, reg: RegId) {
        let len = self.operands.len();
        let opcode = self.opcode();
        match self.operands.get_mut(i) {
            Some(slot) => *slot = reg,
            None => panic!("operand {i} out of bounds for {opcode} with {len} operands"),
        }
    }

    pub fn operands(&self) -> &[RegId] {
        &self.operands
    }

    pub fn output(&self) -> Option<RegId> {
        self.output
    }

    pub fn set_output(&mut self, output: Option<RegId>) {
        self.output = output;
    }

    // -- placement ----------------------------------------------------------

    pub fn bc_offset(&self) -> Option<BcOffset> {
        self.bc_offset
    }

    pub fn set_bc_offset(&mut self, offset: BcOffset) {
        self.bc_offset = Some(offset);
    }

    /// The block this instruction is linked into.
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn is_linked(&self) -> bool {
        self.block.is_some()
    }

    pub(crate) fn link(&mut self, block: BlockId) {
        if let Some(current) = self.block {
            panic!("{} is already linked into {current}", self.opcode());
        }
        self.block = Some(block);
    }

    pub(crate) fn unlink(&mut self) {
        self.block = None;
    }

    /// An exact copy, keeping block and offset. Used when a whole block is
    /// duplicated.
    pub(crate) fn clone_in_place(&self) -> Instr {
        let mut copy = self.clone();
        copy.block = self.block;
        copy.bc_offset = self.bc_offset;
        copy
    }

    // -- frame state --------------------------------------------------------

    pub fn frame_state(&self) -> Option<&FrameState> {
        self.frame_state.as_deref()
    }

    pub fn frame_state_mut(&mut self) -> Option<&mut FrameState> {
        self.frame_state.as_deref_mut()
    }

    /// Attach a frame state, replacing any previous one.
    ///
    /// # Panics
    /// Panics if the opcode cannot carry a frame state.
    pub fn set_frame_state(&mut self, fs: FrameState) {
        assert!(
            self.opcode().has_frame_state(),
            "{} cannot carry a frame state",
            self.opcode()
        );
        self.frame_state = Some(Box::new(fs));
    }

    pub fn take_frame_state(&mut self) -> Option<FrameState> {
        self.frame_state.take().map(|fs| *fs)
    }

    // -- deopt data ---------------------------------------------------------

    /// Deopt data, present exactly for deopt-capable opcodes.
    pub fn deopt_info(&self) -> Option<&DeoptInfo> {
        self.deopt.as_ref()
    }

    fn deopt_mut(&mut self) -> &mut DeoptInfo {
        let opcode = self.opcode();
        self.deopt
            .as_mut()
            .unwrap_or_else(|| panic!("{opcode} cannot deoptimize"))
    }

    pub fn live_regs(&self) -> &[RegState] {
        self.deopt.as_ref().map_or(&[], |d| d.live_regs.as_slice())
    }

    /// Record a live register. Registers already present are updated.
    ///
    /// # Panics
    /// Panics if the opcode cannot deoptimize.
    pub fn add_live_reg(&mut self, state: RegState) {
        let deopt = self.deopt_mut();
        match deopt.live_regs.iter_mut().find(|s| s.reg == state.reg) {
            Some(existing) => *existing = state,
            None => deopt.live_regs.push(state),
        }
    }

    pub fn set_live_regs(&mut self, live_regs: Vec<RegState>) {
        self.deopt_mut().live_regs = live_regs;
    }

    pub fn guilty_reg(&self) -> Option<RegId> {
        self.deopt.as_ref().and_then(|d| d.guilty_reg)
    }

    pub fn set_guilty_reg(&mut self, reg: RegId) {
        self.deopt_mut().guilty_reg = Some(reg);
    }

    pub fn descr(&self) -> Option<&str> {
        self.deopt.as_ref().and_then(|d| d.descr.as_deref())
    }

    pub fn set_descr(&mut self, descr: impl Into<String>) {
        self.deopt_mut().descr = Some(descr.into());
    }

    // -- use/def ------------------------------------------------------------

    /// Call `f` for every register this instruction reads: operands, frame
    /// state slots and live registers.
    pub fn visit_uses(&self, mut f: impl FnMut(RegId)) {
        for reg in self.operands.iter() {
            f(*reg);
        }
        if let Some(fs) = &self.frame_state {
            fs.visit_uses(&mut f);
        }
        for state in self.live_regs() {
            f(state.reg);
        }
    }

    pub fn uses(&self, reg: RegId) -> bool {
        let mut found = false;
        self.visit_uses(|r| found |= r == reg);
        found
    }

    /// Replace every read of `old` with `new`.
    pub fn replace_uses_of(&mut self, old: RegId, new: RegId) {
        for slot in self.operands.iter_mut() {
            if *slot == old {
                *slot = new;
            }
        }
        if let Some(fs) = &mut self.frame_state {
            fs.replace_uses_of(old, new);
        }
        if let Some(deopt) = &mut self.deopt {
            for state in deopt.live_regs.iter_mut() {
                if state.reg == old {
                    state.reg = new;
                }
            }
            if deopt.guilty_reg == Some(old) {
                deopt.guilty_reg = Some(new);
            }
        }
    }
}

impl Clone for Instr {
    /// The copy has the same operands, a deep copy of the frame state and the
    /// same live registers. It is unlinked and has no bytecode offset.
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            operands: self.operands.clone(),
            output: self.output,
            bc_offset: None,
            block: None,
            frame_state: self.frame_state.clone(),
            deopt: self.deopt.clone(),
        }
    }
}
