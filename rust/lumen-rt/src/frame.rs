//! Interpreter frames, the call chain and captured machine state.

use std::fmt;
use std::sync::Arc;

use strum::Display;

use lumen_codegen::{Location, WORD_SIZE};
use lumen_core::code::{BcOffset, CodeUnit};
use lumen_core::values::{Heap, ObjRef};
use lumen_hir::ExecutionBlock;

// ---------------------------------------------------------------------------
// Machine snapshot
// ---------------------------------------------------------------------------

/// Raw machine state captured when native code traps: the register file
/// and the frame's spill area, both as 64-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub regs: Vec<u64>,
    pub spill: Vec<u64>,
}

impl MachineSnapshot {
    pub fn new(regs: Vec<u64>, spill: Vec<u64>) -> Self {
        Self { regs, spill }
    }

    /// A snapshot with only a spill area, as saved by a suspended generator.
    pub fn from_spill(spill: Vec<u64>) -> Self {
        Self {
            regs: Vec::new(),
            spill,
        }
    }

    pub fn set(&mut self, location: Location, word: u64) {
        let (words, index) = match location {
            Location::Reg(reg) => (&mut self.regs, usize::from(reg.0)),
            Location::Stack(offset) => (&mut self.spill, spill_index(offset)),
        };
        if words.len() <= index {
            words.resize(index + 1, 0);
        }
        words[index] = word;
    }

    /// Read the word at `location`.
    ///
    /// # Panics
    /// Panics if the location lies outside the snapshot.
    pub fn read(&self, location: Location) -> u64 {
        let word = match location {
            Location::Reg(reg) => self.regs.get(usize::from(reg.0)),
            Location::Stack(offset) => self.spill.get(spill_index(offset)),
        };
        match word {
            Some(word) => *word,
            None => panic!("{location} is outside the captured machine state"),
        }
    }
}

fn spill_index(offset: i32) -> usize {
    match usize::try_from(offset) {
        Ok(offset) if offset % WORD_SIZE == 0 => offset / WORD_SIZE,
        _ => panic!("spill offset {offset} is not a word offset"),
    }
}

// ---------------------------------------------------------------------------
// Interpreter frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FrameStatus {
    Created,
    Executing,
    Suspended,
    Completed,
}

/// The interpreter's view of one activation.
///
/// Every `Some` slot holds one reference to its object.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterFrame {
    pub code: Arc<CodeUnit>,
    /// Locals, then cells, then free variables. `None` is an empty slot.
    pub localsplus: Vec<Option<ObjRef>>,
    /// Operand stack, bottom first. `None` is an empty slot.
    pub stack: Vec<Option<ObjRef>>,
    pub block_stack: Vec<ExecutionBlock>,
    /// Offset of the next instruction to execute.
    pub next_instr: BcOffset,
    /// Source line of `next_instr`, if known.
    pub line: Option<u32>,
    pub status: FrameStatus,
    /// Generator owning this frame.
    pub gen: Option<ObjRef>,
    materialized: bool,
}

impl InterpreterFrame {
    /// A fresh frame for `code`, with every slot empty.
    pub fn new(code: Arc<CodeUnit>) -> Self {
        let slots = code.num_localsplus();
        Self {
            code,
            localsplus: vec![None; slots],
            stack: Vec::new(),
            block_stack: Vec::new(),
            next_instr: BcOffset::new(0),
            line: None,
            status: FrameStatus::Created,
            gen: None,
            materialized: false,
        }
    }

    /// Offset of the last instruction considered executed.
    pub fn lasti(&self) -> BcOffset {
        self.next_instr.prev()
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    pub(crate) fn mark_materialized(&mut self) {
        self.materialized = true;
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Drop every reference the frame holds and empty it.
    pub fn clear(&mut self, heap: &mut Heap) {
        for slot in self.localsplus.iter_mut().chain(self.stack.iter_mut()) {
            heap.xdecref(slot.take());
        }
        self.stack.clear();
        self.block_stack.clear();
        self.status = FrameStatus::Completed;
    }
}

impl fmt::Display for InterpreterFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<frame {} @{}", self.code.qualname, self.next_instr)?;
        if let Some(line) = self.line {
            write!(f, " line {line}")?;
        }
        write!(f, " {}>", self.status)
    }
}

// ---------------------------------------------------------------------------
// Call chain
// ---------------------------------------------------------------------------

/// Handle to a frame in a [`CallChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(usize);

#[derive(Debug, Clone)]
struct ChainEntry {
    frame: InterpreterFrame,
    /// Whether the frame is linked into the active call chain. A generator
    /// resumed while propagating an exception runs without being linked.
    linked: bool,
    back: Option<FrameId>,
}

/// The interpreter thread's frames, oldest first.
#[derive(Debug, Clone, Default)]
pub struct CallChain {
    entries: Vec<ChainEntry>,
}

impl CallChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame whose caller is the nearest linked frame.
    pub fn push(&mut self, frame: InterpreterFrame, linked: bool) -> FrameId {
        let back = self.nearest_linked();
        self.push_with_back(frame, linked, back)
    }

    pub fn push_with_back(
        &mut self,
        frame: InterpreterFrame,
        linked: bool,
        back: Option<FrameId>,
    ) -> FrameId {
        self.entries.push(ChainEntry {
            frame,
            linked,
            back,
        });
        FrameId(self.entries.len() - 1)
    }

    /// The most recent frame linked into the chain. Unlinked frames above it
    /// are skipped.
    pub fn nearest_linked(&self) -> Option<FrameId> {
        self.entries
            .iter()
            .rposition(|entry| entry.linked)
            .map(FrameId)
    }

    /// Remove the newest frame.
    pub fn pop(&mut self) -> Option<InterpreterFrame> {
        self.entries.pop().map(|entry| entry.frame)
    }

    pub fn top(&self) -> Option<FrameId> {
        self.entries.len().checked_sub(1).map(FrameId)
    }

    pub fn frame(&self, id: FrameId) -> &InterpreterFrame {
        &self.entries[id.0].frame
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut InterpreterFrame {
        &mut self.entries[id.0].frame
    }

    pub fn back(&self, id: FrameId) -> Option<FrameId> {
        self.entries[id.0].back
    }

    pub fn is_linked(&self, id: FrameId) -> bool {
        self.entries[id.0].linked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
