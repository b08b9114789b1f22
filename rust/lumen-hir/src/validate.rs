//! Structural validation of a [`Function`].
//!
//! Checks the invariants later stages rely on: block termination, branch
//! targets, register existence and single definition, phi arity, the
//! presence and shape of frame states on deopt-capable instructions, and
//! consistent inlining depth along every path.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::block::BlockId;
use crate::function::Function;
use crate::opcode::{InstrKind, Opcode};
use crate::register::RegId;

/// Structural IR errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("{block} does not end in a terminator")]
    MissingTerminator { block: BlockId },

    #[error("{block}: terminator {opcode} at position {index} is not last")]
    MisplacedTerminator {
        block: BlockId,
        index: usize,
        opcode: Opcode,
    },

    #[error("{block}: branch to nonexistent block {target}")]
    UnknownBlock { block: BlockId, target: BlockId },

    #[error("{block}: {opcode} references unknown register {reg}")]
    UnknownRegister {
        block: BlockId,
        opcode: Opcode,
        reg: RegId,
    },

    #[error("{reg} is defined more than once")]
    MultipleDefinitions { reg: RegId },

    #[error("{block}: {opcode} must define an output")]
    MissingOutput { block: BlockId, opcode: Opcode },

    #[error("{block}: {opcode} cannot define an output")]
    UnexpectedOutput { block: BlockId, opcode: Opcode },

    #[error("{block}: phi has {found} inputs but the block has {expected} predecessors")]
    PhiArity {
        block: BlockId,
        expected: usize,
        found: usize,
    },

    #[error("{block}: phi input from {pred}, which is not a predecessor")]
    PhiPredecessor { block: BlockId, pred: BlockId },

    #[error("{block}: {opcode} has no frame state")]
    MissingFrameState { block: BlockId, opcode: Opcode },

    #[error("frame state for {code} is malformed: {detail}")]
    FrameShape { code: String, detail: String },

    #[error("{block}: inline depth {found} where {expected} was expected")]
    InlineDepth {
        block: BlockId,
        expected: usize,
        found: usize,
    },

    #[error("{block}: EndInlinedFunction without a matching BeginInlinedFunction")]
    UnbalancedInline { block: BlockId },
}

/// Validate every reachable block of `func`.
pub fn validate_function(func: &Function) -> Result<(), IrError> {
    let rpo = func.cfg.rpo();
    let preds = func.cfg.predecessors();
    let mut defined = HashSet::new();

    for &id in &rpo {
        let block = func.cfg.block(id);
        let Some(last) = block.last() else {
            return Err(IrError::MissingTerminator { block: id });
        };
        if !last.is_terminator() {
            return Err(IrError::MissingTerminator { block: id });
        }

        for (index, instr) in block.iter().enumerate() {
            let opcode = instr.opcode();
            if opcode.is_terminator() && index + 1 != block.len() {
                return Err(IrError::MisplacedTerminator {
                    block: id,
                    index,
                    opcode,
                });
            }
            for target in instr.successors() {
                if !func.cfg.contains(target) {
                    return Err(IrError::UnknownBlock { block: id, target });
                }
            }

            let mut unknown = None;
            instr.visit_uses(|reg| {
                if unknown.is_none() && !func.env.contains(reg) {
                    unknown = Some(reg);
                }
            });
            if let Some(reg) = unknown {
                return Err(IrError::UnknownRegister {
                    block: id,
                    opcode,
                    reg,
                });
            }

            match (instr.output(), opcode.has_output()) {
                (None, true) => return Err(IrError::MissingOutput { block: id, opcode }),
                (Some(_), false) => return Err(IrError::UnexpectedOutput { block: id, opcode }),
                (Some(out), true) => {
                    if !func.env.contains(out) {
                        return Err(IrError::UnknownRegister {
                            block: id,
                            opcode,
                            reg: out,
                        });
                    }
                    if !defined.insert(out) {
                        return Err(IrError::MultipleDefinitions { reg: out });
                    }
                }
                (None, false) => {}
            }

            if let InstrKind::Phi { blocks } = instr.kind() {
                let block_preds = preds.get(&id).map(Vec::as_slice).unwrap_or_default();
                if blocks.len() != block_preds.len() {
                    return Err(IrError::PhiArity {
                        block: id,
                        expected: block_preds.len(),
                        found: blocks.len(),
                    });
                }
                if let Some(pred) = blocks.iter().find(|b| !block_preds.contains(b)) {
                    return Err(IrError::PhiPredecessor {
                        block: id,
                        pred: *pred,
                    });
                }
            }

            match instr.frame_state() {
                Some(fs) => fs.check_shape()?,
                None if opcode.has_deopt_data() || opcode == Opcode::BeginInlinedFunction => {
                    return Err(IrError::MissingFrameState { block: id, opcode });
                }
                None => {}
            }
        }
    }

    check_inline_depth(func, &rpo)
}

/// Every path must agree on the inline depth at block entry, and every
/// frame state's caller chain must be as deep as the inlining at its
/// position.
fn check_inline_depth(func: &Function, rpo: &[BlockId]) -> Result<(), IrError> {
    let mut entry_depth: HashMap<BlockId, usize> = HashMap::new();
    entry_depth.insert(func.cfg.entry(), 0);

    for &id in rpo {
        // RPO reaches a forward predecessor first, so the depth is known.
        let mut depth = entry_depth.get(&id).copied().unwrap_or(0);
        let block = func.cfg.block(id);
        for instr in block.iter() {
            match instr.opcode() {
                Opcode::BeginInlinedFunction => {
                    if let Some(fs) = instr.frame_state() {
                        expect_depth(id, depth, fs.inline_depth())?;
                    }
                    depth += 1;
                }
                Opcode::EndInlinedFunction => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or(IrError::UnbalancedInline { block: id })?;
                }
                _ => {
                    if let Some(fs) = instr.frame_state() {
                        expect_depth(id, depth, fs.inline_depth())?;
                    }
                }
            }
        }
        for succ in block.successors() {
            match entry_depth.get(&succ) {
                Some(&expected) if expected != depth => {
                    return Err(IrError::InlineDepth {
                        block: succ,
                        expected,
                        found: depth,
                    });
                }
                Some(_) => {}
                None => {
                    entry_depth.insert(succ, depth);
                }
            }
        }
    }
    Ok(())
}

fn expect_depth(block: BlockId, expected: usize, found: usize) -> Result<(), IrError> {
    if expected == found {
        Ok(())
    } else {
        Err(IrError::InlineDepth {
            block,
            expected,
            found,
        })
    }
}
