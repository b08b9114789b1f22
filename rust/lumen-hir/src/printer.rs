//! Textual form of the IR.
//!
//! Instructions print as `[dst =] Opcode<immediates> operands... { state }`,
//! blocks as a labelled list of instructions and functions as a list of
//! blocks in id order. Used in logs, test assertions and error reports.

use std::fmt;

use crate::block::BasicBlock;
use crate::function::Function;
use crate::instr::{Instr, RefKind, RegState};

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.ref_kind {
            RefKind::Uncounted => "u",
            RefKind::Borrowed => "b",
            RefKind::Owned => "o",
        };
        write!(f, "{tag}:{}:{}", self.value_kind, self.reg)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(out) = self.output() {
            write!(f, "{out} = ")?;
        }
        f.write_str(self.opcode().name())?;
        if let Some(imm) = self.kind().immediates() {
            write!(f, "<{imm}>")?;
        }
        for reg in self.operands() {
            write!(f, " {reg}")?;
        }
        if let Some(fs) = self.frame_state() {
            write!(f, " {fs}")?;
        }
        let live = self.live_regs();
        if !live.is_empty() {
            f.write_str(" LiveValues=<")?;
            for (i, state) in live.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{state}")?;
            }
            f.write_str(">")?;
        }
        if let Some(descr) = self.descr() {
            write!(f, " \"{descr}\"")?;
        }
        Ok(())
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id())?;
        for instr in self.iter() {
            writeln!(f, "  {instr}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fun {} {{", self.name)?;
        for block in self.cfg.blocks() {
            write!(f, "{block}")?;
        }
        f.write_str("}")
    }
}
