//! Bytecode unit descriptions.
//!
//! A [`CodeUnit`] is the identity of one interpreter bytecode unit: its
//! local/cell layout, operand stack bound and line table. The JIT never
//! interprets bytecode itself; it only needs the shape of the interpreter
//! frame and the mapping from bytecode offsets to source lines.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Size in bytes of one bytecode instruction (opcode + argument).
pub const CODE_UNIT_SIZE: i32 = 2;

/// Identity of a bytecode unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeId(pub u32);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// Byte offset of an instruction within a bytecode unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BcOffset(i32);

impl BcOffset {
    /// Offset used before the first instruction has executed.
    pub const START: BcOffset = BcOffset(-CODE_UNIT_SIZE);

    pub const fn new(offset: i32) -> Self {
        Self(offset)
    }

    pub const fn from_index(index: i32) -> Self {
        Self(index * CODE_UNIT_SIZE)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    /// Index of the instruction in code-unit granularity.
    pub const fn index(self) -> i32 {
        self.0 / CODE_UNIT_SIZE
    }

    /// Offset of the instruction immediately following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + CODE_UNIT_SIZE)
    }

    pub const fn prev(self) -> Self {
        Self(self.0 - CODE_UNIT_SIZE)
    }
}

impl fmt::Display for BcOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of routine a code unit implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum CodeKind {
    Function,
    Generator,
    Coroutine,
}

/// One line-table entry: instructions from `start` onward belong to `line`
/// until the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub start: BcOffset,
    pub line: u32,
}

/// Description of a bytecode unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub id: CodeId,
    pub name: String,
    pub qualname: String,
    pub kind: CodeKind,
    pub num_args: usize,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    /// Maximum operand stack depth.
    pub stack_size: usize,
    /// Length of the bytecode in bytes.
    pub code_len: usize,
    #[serde(default)]
    pub line_table: Vec<LineEntry>,
}

impl CodeUnit {
    pub fn new(id: CodeId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            qualname: name.to_string(),
            kind: CodeKind::Function,
            num_args: 0,
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            stack_size: 0,
            code_len: 0,
            line_table: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: CodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_args(mut self, num_args: usize) -> Self {
        self.num_args = num_args;
        self
    }

    pub fn with_locals(mut self, names: &[&str]) -> Self {
        self.varnames = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_cells(mut self, names: &[&str]) -> Self {
        self.cellvars = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_freevars(mut self, names: &[&str]) -> Self {
        self.freevars = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_code_len(mut self, code_len: usize) -> Self {
        self.code_len = code_len;
        self
    }

    /// Set the line table from `(offset, line)` pairs in increasing offset
    /// order.
    pub fn with_lines(mut self, entries: &[(i32, u32)]) -> Self {
        self.line_table = entries
            .iter()
            .map(|&(start, line)| LineEntry {
                start: BcOffset::new(start),
                line,
            })
            .collect();
        self
    }

    pub fn num_locals(&self) -> usize {
        self.varnames.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cellvars.len()
    }

    pub fn num_freevars(&self) -> usize {
        self.freevars.len()
    }

    /// Cell and free variable slots, which follow the plain locals in the
    /// interpreter frame.
    pub fn num_cell_slots(&self) -> usize {
        self.num_cells() + self.num_freevars()
    }

    /// Total interpreter slots: locals, then cells, then free variables.
    pub fn num_localsplus(&self) -> usize {
        self.num_locals() + self.num_cell_slots()
    }

    pub fn is_generator_like(&self) -> bool {
        matches!(self.kind, CodeKind::Generator | CodeKind::Coroutine)
    }

    /// Whether `offset` addresses an instruction of this unit.
    pub fn contains(&self, offset: BcOffset) -> bool {
        offset.value() >= 0 && (offset.value() as usize) < self.code_len
    }

    /// Source line for the instruction at `offset`, or `None` if the offset
    /// is outside the unit or the line table does not cover it.
    pub fn line_for(&self, offset: BcOffset) -> Option<u32> {
        if !self.contains(offset) {
            return None;
        }
        self.line_table
            .iter()
            .take_while(|entry| entry.start <= offset)
            .last()
            .map(|entry| entry.line)
    }
}
