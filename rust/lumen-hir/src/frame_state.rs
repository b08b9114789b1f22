//! Interpreter-visible state at a point in compiled code.
//!
//! A [`FrameState`] records, in terms of IR registers, what the interpreter
//! frame would contain if execution were handed back at this point: locals,
//! cell and free variable slots, the operand stack and the handler stack.
//! Inlined callees chain to their caller's state through `parent`.

use std::fmt;
use std::sync::Arc;

use strum::Display;

use lumen_core::code::{BcOffset, CodeUnit};

use crate::register::RegId;
use crate::validate::IrError;

/// Kind of an entry on the interpreter's handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum HandlerKind {
    SetupFinally,
    SetupWith,
    SetupAsyncWith,
    ExceptHandler,
    Loop,
}

/// One handler-stack entry. Contains no register references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionBlock {
    pub opcode: HandlerKind,
    pub handler_off: BcOffset,
    /// Operand stack depth to unwind to when the handler runs.
    pub stack_level: usize,
}

impl ExecutionBlock {
    pub fn new(opcode: HandlerKind, handler_off: BcOffset, stack_level: usize) -> Self {
        Self {
            opcode,
            handler_off,
            stack_level,
        }
    }
}

impl fmt::Display for ExecutionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{}, {}>",
            self.opcode, self.handler_off, self.stack_level
        )
    }
}

/// The handler stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStack(Vec<ExecutionBlock>);

impl BlockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: ExecutionBlock) {
        self.0.push(block);
    }

    pub fn pop(&mut self) -> Option<ExecutionBlock> {
        self.0.pop()
    }

    pub fn top(&self) -> Option<&ExecutionBlock> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExecutionBlock> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ExecutionBlock] {
        &self.0
    }
}

impl FromIterator<ExecutionBlock> for BlockStack {
    fn from_iter<I: IntoIterator<Item = ExecutionBlock>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The operand stack, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperandStack(Vec<RegId>);

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reg: RegId) {
        self.0.push(reg);
    }

    pub fn pop(&mut self) -> Option<RegId> {
        self.0.pop()
    }

    pub fn top(&self) -> Option<RegId> {
        self.0.last().copied()
    }

    /// The `n`th value from the top (`peek(1)` is the top).
    pub fn peek(&self, n: usize) -> Option<RegId> {
        self.0.len().checked_sub(n).and_then(|i| self.0.get(i)).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[RegId] {
        &self.0
    }

    fn iter_mut(&mut self) -> std::slice::IterMut<'_, RegId> {
        self.0.iter_mut()
    }
}

impl FromIterator<RegId> for OperandStack {
    fn from_iter<I: IntoIterator<Item = RegId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// FrameState
// ---------------------------------------------------------------------------

/// Snapshot of one interpreter frame, plus the frames it is inlined into.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub code: Arc<CodeUnit>,
    /// Offset of the bytecode instruction being executed.
    pub cur_instr_offs: BcOffset,
    /// Plain locals, in slot order. `None` is a dead or unbound slot.
    pub locals: Vec<Option<RegId>>,
    /// Cell then free variable slots.
    pub cells: Vec<Option<RegId>>,
    pub stack: OperandStack,
    pub block_stack: BlockStack,
    /// State of the caller this frame is inlined into.
    pub parent: Option<Box<FrameState>>,
}

impl FrameState {
    /// An empty state for `code` with every slot dead.
    pub fn new(code: Arc<CodeUnit>) -> Self {
        let locals = vec![None; code.num_locals()];
        let cells = vec![None; code.num_cell_slots()];
        Self {
            code,
            cur_instr_offs: BcOffset::START,
            locals,
            cells,
            stack: OperandStack::new(),
            block_stack: BlockStack::new(),
            parent: None,
        }
    }

    pub fn at(mut self, offset: BcOffset) -> Self {
        self.cur_instr_offs = offset;
        self
    }

    pub fn with_parent(mut self, parent: FrameState) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Offset the interpreter continues at once the current instruction has
    /// completed.
    pub fn next_instr_offset(&self) -> BcOffset {
        self.cur_instr_offs.next()
    }

    /// Number of callers this state is inlined into.
    pub fn inline_depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self.parent.as_deref();
        while let Some(fs) = cur {
            depth += 1;
            cur = fs.parent.as_deref();
        }
        depth
    }

    /// Every frame in the caller chain, outermost first. The last element is
    /// `self`.
    pub fn frames(&self) -> Vec<&FrameState> {
        let mut frames = Vec::with_capacity(self.inline_depth() + 1);
        let mut cur = Some(self);
        while let Some(fs) = cur {
            frames.push(fs);
            cur = fs.parent.as_deref();
        }
        frames.reverse();
        frames
    }

    /// Locals followed by cells, matching the interpreter's slot layout.
    pub fn localsplus(&self) -> impl Iterator<Item = Option<RegId>> + '_ {
        self.locals.iter().chain(self.cells.iter()).copied()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Call `f` for every register referenced by this state and its callers.
    pub fn visit_uses(&self, f: &mut impl FnMut(RegId)) {
        for reg in self.locals.iter().chain(self.cells.iter()).flatten() {
            f(*reg);
        }
        for reg in self.stack.iter() {
            f(*reg);
        }
        if let Some(parent) = &self.parent {
            parent.visit_uses(f);
        }
    }

    /// Whether `reg` appears anywhere in the chain.
    pub fn uses(&self, reg: RegId) -> bool {
        let mut found = false;
        self.visit_uses(&mut |r| found |= r == reg);
        found
    }

    /// Replace every reference to `old` with `new` throughout the chain.
    pub fn replace_uses_of(&mut self, old: RegId, new: RegId) {
        for slot in self.locals.iter_mut().chain(self.cells.iter_mut()) {
            if *slot == Some(old) {
                *slot = Some(new);
            }
        }
        for reg in self.stack.iter_mut() {
            if *reg == old {
                *reg = new;
            }
        }
        if let Some(parent) = &mut self.parent {
            parent.replace_uses_of(old, new);
        }
    }

    /// Check this frame (and its callers) against the code unit layout.
    pub fn check_shape(&self) -> Result<(), IrError> {
        let code = &self.code;
        if self.locals.len() != code.num_locals() {
            return Err(IrError::FrameShape {
                code: code.qualname.clone(),
                detail: format!(
                    "{} locals recorded, code has {}",
                    self.locals.len(),
                    code.num_locals()
                ),
            });
        }
        if self.cells.len() != code.num_cell_slots() {
            return Err(IrError::FrameShape {
                code: code.qualname.clone(),
                detail: format!(
                    "{} cell slots recorded, code has {}",
                    self.cells.len(),
                    code.num_cell_slots()
                ),
            });
        }
        if self.stack.len() > code.stack_size {
            return Err(IrError::FrameShape {
                code: code.qualname.clone(),
                detail: format!(
                    "stack depth {} exceeds stack size {}",
                    self.stack.len(),
                    code.stack_size
                ),
            });
        }
        if let Some(block) = self
            .block_stack
            .iter()
            .find(|block| block.stack_level > self.stack.len())
        {
            return Err(IrError::FrameShape {
                code: code.qualname.clone(),
                detail: format!(
                    "handler {block} unwinds to level {} above stack depth {}",
                    block.stack_level,
                    self.stack.len()
                ),
            });
        }
        match &self.parent {
            Some(parent) => parent.check_shape(),
            None => Ok(()),
        }
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn regs(f: &mut fmt::Formatter<'_>, label: &str, slots: &[Option<RegId>]) -> fmt::Result {
            if slots.is_empty() {
                return Ok(());
            }
            write!(f, " {label}=<")?;
            for (i, slot) in slots.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                match slot {
                    Some(reg) => write!(f, "{reg}")?,
                    None => f.write_str("_")?,
                }
            }
            f.write_str(">")
        }

        if let Some(parent) = &self.parent {
            write!(f, "{parent} => ")?;
        }
        write!(f, "{{ {}@{}", self.code.qualname, self.cur_instr_offs)?;
        regs(f, "Locals", &self.locals)?;
        regs(f, "Cells", &self.cells)?;
        if !self.stack.is_empty() {
            f.write_str(" Stack=<")?;
            for (i, reg) in self.stack.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{reg}")?;
            }
            f.write_str(">")?;
        }
        if !self.block_stack.is_empty() {
            f.write_str(" BlockStack=<")?;
            for (i, block) in self.block_stack.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{block}")?;
            }
            f.write_str(">")?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Environment;
    use lumen_core::code::CodeId;

    fn code(name: &str, locals: &[&str], stack: usize) -> Arc<CodeUnit> {
        Arc::new(
            CodeUnit::new(CodeId(1), name)
                .with_locals(locals)
                .with_stack_size(stack)
                .with_code_len(40),
        )
    }

    #[test]
    fn frames_are_outermost_first() {
        let outer = FrameState::new(code("outer", &["a", "b"], 2)).at(BcOffset::new(10));
        let inner = FrameState::new(code("inner", &["x"], 1))
            .at(BcOffset::new(4))
            .with_parent(outer);
        assert_eq!(inner.inline_depth(), 1);
        let frames = inner.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].code.name, "outer");
        assert_eq!(frames[1].code.name, "inner");
    }

    #[test]
    fn replace_uses_reaches_parents() {
        let mut env = Environment::new();
        let a = env.allocate_register();
        let b = env.allocate_register();
        let mut outer = FrameState::new(code("outer", &["a"], 2));
        outer.locals[0] = Some(a);
        outer.stack.push(a);
        let mut inner = FrameState::new(code("inner", &["x"], 1)).with_parent(outer);
        inner.locals[0] = Some(a);

        inner.replace_uses_of(a, b);
        assert!(!inner.uses(a));
        let parent = inner.parent.as_deref().unwrap();
        assert_eq!(parent.locals[0], Some(b));
        assert_eq!(parent.stack.top(), Some(b));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut env = Environment::new();
        let r = env.allocate_register();
        let mut fs = FrameState::new(code("f", &["a"], 1));
        assert!(fs.check_shape().is_ok());
        fs.stack.push(r);
        fs.stack.push(r);
        assert!(matches!(fs.check_shape(), Err(IrError::FrameShape { .. })));

        let mut fs = FrameState::new(code("f", &["a"], 1));
        fs.block_stack
            .push(ExecutionBlock::new(HandlerKind::SetupFinally, BcOffset::new(8), 1));
        assert!(fs.check_shape().is_err());
    }

    #[test]
    fn peek_counts_from_top() {
        let mut env = Environment::new();
        let a = env.allocate_register();
        let b = env.allocate_register();
        let stack: OperandStack = [a, b].into_iter().collect();
        assert_eq!(stack.peek(1), Some(b));
        assert_eq!(stack.peek(2), Some(a));
        assert_eq!(stack.peek(3), None);
    }
}
