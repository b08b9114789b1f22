//! Basic blocks.

use std::fmt;

use crate::instr::Instr;

/// Stable handle to a block in a [`Cfg`](crate::function::Cfg).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A straight-line sequence of instructions.
///
/// The block exclusively owns its instructions. Removing one hands
/// ownership back to the caller, unlinked.
#[derive(Debug)]
pub struct BasicBlock {
    id: BlockId,
    instrs: Vec<Instr>,
}

impl BasicBlock {
    pub(crate) fn new(id: BlockId) -> Self {
        Self {
            id,
            instrs: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Append an instruction, linking it to this block.
    ///
    /// # Panics
    /// Panics if the instruction is already linked into a block.
    pub fn push(&mut self, mut instr: Instr) -> usize {
        instr.link(self.id);
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    /// Insert an instruction before position `index`.
    pub fn insert(&mut self, index: usize, mut instr: Instr) {
        instr.link(self.id);
        self.instrs.insert(index, instr);
    }

    /// Unlink the instruction at `index` and return it.
    pub fn remove(&mut self, index: usize) -> Instr {
        let mut instr = self.instrs.remove(index);
        instr.unlink();
        instr
    }

    /// Replace the instruction at `index`, returning the old one unlinked.
    pub fn replace(&mut self, index: usize, mut instr: Instr) -> Instr {
        instr.link(self.id);
        let mut old = std::mem::replace(&mut self.instrs[index], instr);
        old.unlink();
        old
    }

    pub fn instr(&self, index: usize) -> &Instr {
        &self.instrs[index]
    }

    pub fn instr_mut(&mut self, index: usize) -> &mut Instr {
        &mut self.instrs[index]
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.instrs.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Instr> {
        self.instrs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn last(&self) -> Option<&Instr> {
        self.instrs.last()
    }

    /// The final instruction, if it is a terminator.
    pub fn terminator(&self) -> Option<&Instr> {
        self.instrs.last().filter(|instr| instr.is_terminator())
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator()
            .map(|term| term.successors())
            .unwrap_or_default()
    }
}

impl Clone for BasicBlock {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            instrs: self.instrs.iter().map(Instr::clone_in_place).collect(),
        }
    }
}
