//! Control-flow graphs and functions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lumen_core::code::{BcOffset, CodeUnit};

use crate::block::{BasicBlock, BlockId};
use crate::frame_state::FrameState;
use crate::instr::{Instr, RefKind, RegState, ValueKind};
use crate::opcode::{InstrKind, Opcode};
use crate::register::{Environment, RegId};

/// Position of an instruction inside a [`Cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrRef {
    pub block: BlockId,
    pub index: usize,
}

// ---------------------------------------------------------------------------
// Cfg
// ---------------------------------------------------------------------------

/// Basic blocks addressed by stable [`BlockId`]s. Removed blocks leave a
/// hole so ids are never reused.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<Option<BasicBlock>>,
    entry: BlockId,
}

impl Cfg {
    /// A graph containing only an empty entry block.
    pub fn new() -> Self {
        let entry = BlockId::new(0);
        Self {
            blocks: vec![Some(BasicBlock::new(entry))],
            entry,
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn set_entry(&mut self, entry: BlockId) {
        assert!(self.contains(entry), "{entry} is not a block of this graph");
        self.entry = entry;
    }

    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId::new(u32::try_from(self.blocks.len()).expect("block space exhausted"));
        self.blocks.push(Some(BasicBlock::new(id)));
        id
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    /// # Panics
    /// Panics if the block does not exist.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.get(id)
            .unwrap_or_else(|| panic!("{id} is not a block of this graph"))
    }

    /// # Panics
    /// Panics if the block does not exist.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("{id} is not a block of this graph"))
    }

    pub fn remove_block(&mut self, id: BlockId) -> Option<BasicBlock> {
        assert_ne!(id, self.entry, "cannot remove the entry block");
        self.blocks.get_mut(id.index()).and_then(Option::take)
    }

    /// Live blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().flatten()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.blocks.iter_mut().flatten()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks().count()
    }

    pub fn instr(&self, at: InstrRef) -> &Instr {
        self.block(at.block).instr(at.index)
    }

    pub fn instr_mut(&mut self, at: InstrRef) -> &mut Instr {
        self.block_mut(at.block).instr_mut(at.index)
    }

    /// Predecessors of every live block, each list in block id order.
    /// Edges from blocks that no longer exist are not counted.
    pub fn predecessors(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut preds: HashMap<BlockId, Vec<BlockId>> =
            self.blocks().map(|b| (b.id(), Vec::new())).collect();
        for block in self.blocks() {
            for succ in block.successors() {
                if let Some(list) = preds.get_mut(&succ) {
                    if !list.contains(&block.id()) {
                        list.push(block.id());
                    }
                }
            }
        }
        preds
    }

    /// Blocks reachable from the entry, in reverse post-order.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut visited = HashSet::new();
        let mut post = Vec::new();
        // Iterative DFS: (block, next successor index).
        let mut stack = vec![(self.entry, 0usize)];
        visited.insert(self.entry);
        while let Some((id, next)) = stack.pop() {
            let succs = self.get(id).map(BasicBlock::successors).unwrap_or_default();
            if let Some(&succ) = succs.get(next) {
                stack.push((id, next + 1));
                if self.contains(succ) && visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                post.push(id);
            }
        }
        post.reverse();
        post
    }

    /// Delete blocks unreachable from the entry, and the phi inputs that
    /// flowed from them. Returns the removed blocks so their instructions
    /// can be inspected; none of them will produce deopt metadata.
    pub fn remove_unreachable(&mut self) -> Vec<BasicBlock> {
        let reachable: HashSet<BlockId> = self.rpo().into_iter().collect();
        let dead: Vec<BlockId> = self
            .blocks()
            .map(BasicBlock::id)
            .filter(|id| !reachable.contains(id))
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }
        let removed: Vec<BasicBlock> = dead
            .iter()
            .filter_map(|&id| self.blocks.get_mut(id.index()).and_then(Option::take))
            .collect();

        let dead: HashSet<BlockId> = dead.into_iter().collect();
        for block in self.blocks_mut() {
            for index in 0..block.len() {
                let InstrKind::Phi { blocks } = block.instr(index).kind() else {
                    continue;
                };
                if !blocks.iter().any(|b| dead.contains(b)) {
                    continue;
                }
                let old = block.instr(index);
                let (kept_blocks, kept_ops): (Vec<BlockId>, Vec<RegId>) = blocks
                    .iter()
                    .zip(old.operands())
                    .filter(|(b, _)| !dead.contains(b))
                    .map(|(b, r)| (*b, *r))
                    .unzip();
                let mut phi = Instr::new(
                    InstrKind::Phi {
                        blocks: kept_blocks,
                    },
                    &kept_ops,
                    old.output(),
                );
                if let Some(offset) = old.bc_offset() {
                    phi.set_bc_offset(offset);
                }
                block.replace(index, phi);
            }
        }

        let dropped_deopts: usize = removed
            .iter()
            .flat_map(BasicBlock::iter)
            .filter(|instr| instr.opcode().has_deopt_data())
            .count();
        tracing::debug!(
            blocks = removed.len(),
            dropped_deopts,
            "removed unreachable blocks"
        );
        removed
    }
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

/// The IR of one compiled unit.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub code: Arc<CodeUnit>,
    pub env: Environment,
    pub cfg: Cfg,
}

impl Function {
    pub fn new(code: Arc<CodeUnit>) -> Self {
        Self {
            name: code.qualname.clone(),
            code,
            env: Environment::new(),
            cfg: Cfg::new(),
        }
    }

    /// Append an instruction of `kind` to `block`, allocating its output
    /// register if the opcode has one. `LoadConst` and `GuardType` outputs
    /// get the type named by the instruction.
    pub fn emit(&mut self, block: BlockId, kind: InstrKind, operands: &[RegId]) -> Option<RegId> {
        self.push(block, kind, operands, None, None)
    }

    /// Like [`Function::emit`] for instructions that carry a frame state.
    /// The instruction takes its bytecode offset from the state.
    pub fn emit_with_state(
        &mut self,
        block: BlockId,
        kind: InstrKind,
        operands: &[RegId],
        fs: FrameState,
    ) -> Option<RegId> {
        let offset = fs.cur_instr_offs;
        self.push(block, kind, operands, Some(fs), Some(offset))
    }

    fn push(
        &mut self,
        block: BlockId,
        kind: InstrKind,
        operands: &[RegId],
        fs: Option<FrameState>,
        offset: Option<BcOffset>,
    ) -> Option<RegId> {
        let output = kind.opcode().has_output().then(|| self.env.allocate_register());
        if let Some(out) = output {
            match &kind {
                InstrKind::LoadConst { ty } | InstrKind::GuardType { ty } => {
                    self.env.set_type(out, *ty)
                }
                _ => {}
            }
        }
        let mut instr = Instr::new(kind, operands, output);
        if let Some(fs) = fs {
            instr.set_frame_state(fs);
        }
        if let Some(offset) = offset {
            instr.set_bc_offset(offset);
        }
        self.cfg.block_mut(block).push(instr);
        output
    }

    /// Position of the last instruction of `block`.
    pub fn last_instr(&self, block: BlockId) -> InstrRef {
        let len = self.cfg.block(block).len();
        assert!(len > 0, "{block} is empty");
        InstrRef {
            block,
            index: len - 1,
        }
    }

    pub fn instr(&self, at: InstrRef) -> &Instr {
        self.cfg.instr(at)
    }

    pub fn instr_mut(&mut self, at: InstrRef) -> &mut Instr {
        self.cfg.instr_mut(at)
    }

    /// A live-register description for `reg` using its inferred type.
    pub fn reg_state(&self, reg: RegId, ref_kind: RefKind) -> RegState {
        let value_kind = ValueKind::from_type(self.env.type_of(reg));
        let ref_kind = if value_kind.is_primitive() {
            RefKind::Uncounted
        } else {
            ref_kind
        };
        RegState::new(reg, ref_kind, value_kind)
    }

    /// The instruction defining each register.
    pub fn definitions(&self) -> HashMap<RegId, &Instr> {
        self.cfg
            .blocks()
            .flat_map(BasicBlock::iter)
            .filter_map(|instr| instr.output().map(|out| (out, instr)))
            .collect()
    }

    /// Opcode of the instruction defining `reg`, if any.
    pub fn defining_opcode(&self, reg: RegId) -> Option<Opcode> {
        self.cfg
            .blocks()
            .flat_map(BasicBlock::iter)
            .find(|instr| instr.output() == Some(reg))
            .map(Instr::opcode)
    }

    /// Deopt-capable instructions reachable from the entry, in reverse
    /// post-order.
    pub fn deopt_instrs(&self) -> Vec<InstrRef> {
        self.cfg
            .rpo()
            .into_iter()
            .flat_map(|block| {
                self.cfg
                    .block(block)
                    .iter()
                    .enumerate()
                    .filter(|(_, instr)| instr.opcode().has_deopt_data())
                    .map(move |(index, _)| InstrRef { block, index })
            })
            .collect()
    }

    pub fn num_instrs(&self) -> usize {
        self.cfg.blocks().map(BasicBlock::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;
    use lumen_core::code::CodeId;

    fn function() -> Function {
        Function::new(Arc::new(
            CodeUnit::new(CodeId(7), "f")
                .with_locals(&["x"])
                .with_stack_size(2)
                .with_code_len(20),
        ))
    }

    #[test]
    fn rpo_visits_reachable_blocks_once() {
        let mut func = function();
        let entry = func.cfg.entry();
        let left = func.cfg.alloc_block();
        let right = func.cfg.alloc_block();
        let join = func.cfg.alloc_block();
        let orphan = func.cfg.alloc_block();

        let cond = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        func.emit(
            entry,
            InstrKind::CondBranch {
                if_true: left,
                if_false: right,
            },
            &[cond],
        );
        func.emit(left, InstrKind::Branch { target: join }, &[]);
        func.emit(right, InstrKind::Branch { target: join }, &[]);
        func.emit(join, InstrKind::Return, &[cond]);
        func.emit(orphan, InstrKind::Branch { target: join }, &[]);

        let rpo = func.cfg.rpo();
        assert_eq!(rpo.first(), Some(&entry));
        assert_eq!(rpo.last(), Some(&join));
        assert_eq!(rpo.len(), 4);
        assert!(!rpo.contains(&orphan));

        let preds = func.cfg.predecessors();
        assert_eq!(preds[&join], vec![left, right, orphan]);
    }

    #[test]
    fn removing_unreachable_blocks_prunes_phi_inputs() {
        let mut func = function();
        let entry = func.cfg.entry();
        let join = func.cfg.alloc_block();
        let orphan = func.cfg.alloc_block();

        let a = func
            .emit(entry, InstrKind::LoadConst { ty: Type::NONE_TYPE }, &[])
            .unwrap();
        func.emit(entry, InstrKind::Branch { target: join }, &[]);
        let b = func
            .emit(orphan, InstrKind::LoadConst { ty: Type::NONE_TYPE }, &[])
            .unwrap();
        func.emit(orphan, InstrKind::Branch { target: join }, &[]);
        let phi = func
            .emit(
                join,
                InstrKind::Phi {
                    blocks: vec![entry, orphan],
                },
                &[a, b],
            )
            .unwrap();
        func.emit(join, InstrKind::Return, &[phi]);

        let removed = func.cfg.remove_unreachable();
        assert_eq!(removed.len(), 1);
        assert!(!func.cfg.contains(orphan));
        let new_phi = func.cfg.block(join).instr(0);
        assert_eq!(new_phi.operands(), &[a]);
        assert_eq!(new_phi.output(), Some(phi));
        assert_eq!(new_phi.block(), Some(join));
    }

    #[test]
    fn emit_types_constant_outputs() {
        let mut func = function();
        let entry = func.cfg.entry();
        let c = func
            .emit(
                entry,
                InstrKind::LoadConst {
                    ty: Type::from_cint(Type::CINT64, 3),
                },
                &[],
            )
            .unwrap();
        assert_eq!(func.env.type_of(c), Type::from_cint(Type::CINT64, 3));
        assert_eq!(func.reg_state(c, RefKind::Owned).ref_kind, RefKind::Uncounted);
        assert_eq!(func.defining_opcode(c), Some(Opcode::LoadConst));
        assert!(func.emit(entry, InstrKind::Return, &[c]).is_none());
        assert_eq!(func.num_instrs(), 2);
    }
}
