//! Instruction kinds and opcode properties.
//!
//! [`InstrKind`] carries each instruction's immediates. [`Opcode`] is the
//! payload-free tag derived from it; it names instructions in the textual
//! form and answers structural questions (operand count, terminator,
//! whether the instruction can deoptimize).

use strum::{Display, EnumDiscriminants, EnumIter, EnumString, IntoStaticStr};

use lumen_core::code::CodeId;
use lumen_core::values::ObjRef;

use crate::block::BlockId;
use crate::types::Type;

/// Boxed binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum BinaryOpKind {
    Add,
    Subtract,
    Multiply,
    TrueDivide,
    FloorDivide,
    Modulo,
    Power,
    LShift,
    RShift,
    And,
    Or,
    Xor,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum CompareOp {
    LessThan,
    LessThanEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    Is,
    IsNot,
    In,
    NotIn,
}

/// Every instruction kind with its immediates.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(Opcode))]
#[strum_discriminants(derive(Hash, Display, EnumString, IntoStaticStr, EnumIter))]
pub enum InstrKind {
    /// Load a constant. The type must denote a single value.
    LoadConst { ty: Type },
    LoadArg { index: usize },
    Assign,
    LoadCurrentFunc,
    BinaryOp { op: BinaryOpKind },
    /// Binary operation on primitive integers.
    IntBinaryOp { op: BinaryOpKind },
    Compare { op: CompareOp },
    PrimitiveCompare { op: CompareOp },
    IsTruthy,
    LoadAttr { name: String },
    /// Operands: receiver, value.
    StoreAttr { name: String },
    /// Method lookup. The output stands for two interpreter stack slots.
    LoadMethod { name: String },
    /// Operands: callable, receiver, then `nargs` arguments.
    CallMethod { nargs: usize },
    /// Operands: callable, then `nargs` arguments.
    VectorCall { nargs: usize },
    LoadGlobal { name: String },
    LoadField { index: usize, name: String },
    /// Deopt if a field load produced null.
    CheckField { name: String },
    /// Deopt if a local is unbound.
    CheckVar { name: String },
    /// Deopt if a free variable is unbound.
    CheckFreevar { name: String },
    /// Propagate a pending exception if the operand is null.
    CheckExc,
    Guard,
    GuardType { ty: Type },
    GuardIs { target: ObjRef },
    MakeTuple { nvalues: usize },
    MakeList { nvalues: usize },
    Incref,
    Decref,
    XDecref,
    /// One operand per incoming block, in the same order.
    Phi { blocks: Vec<BlockId> },
    /// Carries a frame state only.
    Snapshot,
    /// Start of an inlined callee. Carries the caller's frame state at the
    /// call site.
    BeginInlinedFunction { callee: CodeId },
    EndInlinedFunction,
    InitialYield,
    YieldValue,
    /// Operands: value to send, sub-iterator.
    YieldFrom,
    RunPeriodicTasks,
    Branch { target: BlockId },
    CondBranch { if_true: BlockId, if_false: BlockId },
    CondBranchCheckType {
        ty: Type,
        if_true: BlockId,
        if_false: BlockId,
    },
    Return,
    Raise,
    /// Unconditional deoptimization.
    Deopt,
    /// Patchable point the runtime can turn into a forced deoptimization.
    DeoptPatchpoint,
    Unreachable,
}

impl InstrKind {
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self)
    }

    /// The number of register operands an instruction of this kind has.
    /// Fixed per opcode, or derived from the immediates for variadic
    /// opcodes.
    pub fn operand_count(&self) -> usize {
        match self {
            InstrKind::CallMethod { nargs } => nargs + 2,
            InstrKind::VectorCall { nargs } => nargs + 1,
            InstrKind::MakeTuple { nvalues } | InstrKind::MakeList { nvalues } => *nvalues,
            InstrKind::Phi { blocks } => blocks.len(),
            _ => self
                .opcode()
                .fixed_arity()
                .expect("non-variadic opcode has a fixed arity"),
        }
    }

    /// Branch targets, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstrKind::Branch { target } => vec![*target],
            InstrKind::CondBranch { if_true, if_false }
            | InstrKind::CondBranchCheckType {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            _ => Vec::new(),
        }
    }

    pub fn successor_mut(&mut self, index: usize) -> Option<&mut BlockId> {
        match (self, index) {
            (InstrKind::Branch { target }, 0) => Some(target),
            (InstrKind::CondBranch { if_true, .. }, 0)
            | (InstrKind::CondBranchCheckType { if_true, .. }, 0) => Some(if_true),
            (InstrKind::CondBranch { if_false, .. }, 1)
            | (InstrKind::CondBranchCheckType { if_false, .. }, 1) => Some(if_false),
            _ => None,
        }
    }

    /// Immediates in textual form, without the surrounding `<>`.
    pub fn immediates(&self) -> Option<String> {
        let text = match self {
            InstrKind::LoadConst { ty } | InstrKind::GuardType { ty } => ty.to_string(),
            InstrKind::LoadArg { index } => index.to_string(),
            InstrKind::BinaryOp { op } | InstrKind::IntBinaryOp { op } => op.to_string(),
            InstrKind::Compare { op } | InstrKind::PrimitiveCompare { op } => op.to_string(),
            InstrKind::LoadAttr { name }
            | InstrKind::StoreAttr { name }
            | InstrKind::LoadMethod { name }
            | InstrKind::LoadGlobal { name }
            | InstrKind::CheckField { name }
            | InstrKind::CheckVar { name }
            | InstrKind::CheckFreevar { name } => format!("\"{name}\""),
            InstrKind::LoadField { index, name } => format!("{index}, \"{name}\""),
            InstrKind::CallMethod { nargs } | InstrKind::VectorCall { nargs } => nargs.to_string(),
            InstrKind::MakeTuple { nvalues } | InstrKind::MakeList { nvalues } => {
                nvalues.to_string()
            }
            InstrKind::GuardIs { target } => target.to_string(),
            InstrKind::Phi { blocks } => blocks
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            InstrKind::BeginInlinedFunction { callee } => callee.to_string(),
            InstrKind::Branch { target } => target.to_string(),
            InstrKind::CondBranch { if_true, if_false } => format!("{if_true}, {if_false}"),
            InstrKind::CondBranchCheckType {
                ty,
                if_true,
                if_false,
            } => format!("{if_true}, {if_false}, {ty}"),
            _ => return None,
        };
        Some(text)
    }
}

impl Opcode {
    /// Operand count for opcodes whose arity does not depend on immediates.
    pub fn fixed_arity(self) -> Option<usize> {
        use Opcode::*;
        let arity = match self {
            CallMethod | VectorCall | MakeTuple | MakeList | Phi => return None,
            LoadConst | LoadArg | LoadCurrentFunc | LoadGlobal | Snapshot
            | BeginInlinedFunction | EndInlinedFunction | InitialYield | RunPeriodicTasks
            | Branch | Deopt | DeoptPatchpoint | Unreachable => 0,
            Assign | IsTruthy | LoadAttr | LoadMethod | LoadField | CheckField | CheckVar
            | CheckFreevar | CheckExc | Guard | GuardType | GuardIs | Incref | Decref
            | XDecref | YieldValue | CondBranch | CondBranchCheckType | Return | Raise => 1,
            BinaryOp | IntBinaryOp | Compare | PrimitiveCompare | StoreAttr | YieldFrom => 2,
        };
        Some(arity)
    }

    pub fn is_variadic(self) -> bool {
        self.fixed_arity().is_none()
    }

    /// Whether instructions with this opcode define an output register.
    pub fn has_output(self) -> bool {
        use Opcode::*;
        !matches!(
            self,
            StoreAttr
                | Guard
                | Incref
                | Decref
                | XDecref
                | Snapshot
                | BeginInlinedFunction
                | EndInlinedFunction
                | RunPeriodicTasks
                | Branch
                | CondBranch
                | CondBranchCheckType
                | Return
                | Raise
                | Deopt
                | DeoptPatchpoint
                | Unreachable
        )
    }

    /// Whether the opcode ends a basic block.
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Branch | CondBranch | CondBranchCheckType | Return | Raise | Deopt | Unreachable
        )
    }

    /// Whether instructions with this opcode can deoptimize and therefore
    /// carry live registers, a guilty register and a description.
    pub fn has_deopt_data(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            BinaryOp
                | Compare
                | IsTruthy
                | LoadAttr
                | StoreAttr
                | LoadMethod
                | CallMethod
                | VectorCall
                | LoadGlobal
                | CheckField
                | CheckVar
                | CheckFreevar
                | CheckExc
                | Guard
                | GuardType
                | GuardIs
                | MakeTuple
                | MakeList
                | InitialYield
                | YieldValue
                | YieldFrom
                | RunPeriodicTasks
                | Raise
                | Deopt
                | DeoptPatchpoint
        )
    }

    /// Whether instructions with this opcode may own a frame state.
    pub fn has_frame_state(self) -> bool {
        self.has_deopt_data() || matches!(self, Opcode::Snapshot | Opcode::BeginInlinedFunction)
    }

    /// Whether executing the instruction may raise an exception. Guards and
    /// forced deopts leave the interpreter to decide.
    pub fn could_raise(self) -> bool {
        use Opcode::*;
        self.has_deopt_data() && !matches!(self, Guard | GuardType | GuardIs | Deopt | DeoptPatchpoint)
    }

    /// Operand held responsible when the instruction deoptimizes, if the
    /// opcode has one.
    pub fn guilty_operand(self) -> Option<usize> {
        use Opcode::*;
        match self {
            CheckField | CheckVar | CheckFreevar | Guard | GuardType | GuardIs => Some(0),
            _ => None,
        }
    }

    /// Whether the instruction's output aliases its first operand.
    pub fn is_passthrough(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Assign | CheckField | CheckVar | CheckFreevar | CheckExc | GuardType | GuardIs
        )
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_names_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_str(op.name()).unwrap(), op);
        }
        assert_eq!(Opcode::LoadAttr.to_string(), "LoadAttr");
    }

    #[test]
    fn variadic_operand_counts_follow_immediates() {
        assert_eq!(InstrKind::CallMethod { nargs: 3 }.operand_count(), 5);
        assert_eq!(InstrKind::VectorCall { nargs: 0 }.operand_count(), 1);
        assert_eq!(InstrKind::MakeTuple { nvalues: 4 }.operand_count(), 4);
        assert_eq!(
            InstrKind::Phi {
                blocks: vec![BlockId::new(0), BlockId::new(1)]
            }
            .operand_count(),
            2
        );
        assert_eq!(InstrKind::StoreAttr { name: "x".into() }.operand_count(), 2);
        assert!(Opcode::Phi.is_variadic());
        assert!(!Opcode::Return.is_variadic());
    }

    #[test]
    fn frame_state_owners_are_a_superset_of_deopt_bases() {
        for op in Opcode::iter() {
            if op.has_deopt_data() {
                assert!(op.has_frame_state(), "{op}");
            }
            if op.guilty_operand().is_some() {
                assert!(op.has_deopt_data(), "{op}");
            }
        }
        assert!(Opcode::Snapshot.has_frame_state());
        assert!(!Opcode::Snapshot.has_deopt_data());
        assert!(Opcode::LoadAttr.could_raise());
        assert!(!Opcode::GuardType.could_raise());
        assert!(!Opcode::Assign.could_raise());
    }

    #[test]
    fn terminators() {
        let terminators: Vec<Opcode> = Opcode::iter().filter(|op| op.is_terminator()).collect();
        assert!(terminators.contains(&Opcode::Branch));
        assert!(terminators.contains(&Opcode::CondBranch));
        assert!(terminators.contains(&Opcode::Return));
        assert!(!terminators.contains(&Opcode::DeoptPatchpoint));
        for op in terminators {
            assert!(!op.has_output(), "{op}");
        }
    }

    #[test]
    fn successors_are_mutable_in_place() {
        let mut kind = InstrKind::CondBranch {
            if_true: BlockId::new(1),
            if_false: BlockId::new(2),
        };
        *kind.successor_mut(1).unwrap() = BlockId::new(5);
        assert_eq!(kind.successors(), vec![BlockId::new(1), BlockId::new(5)]);
        assert!(kind.successor_mut(2).is_none());
    }
}
