//! Lumen HIR
//!
//! The typed intermediate representation the JIT optimizes and compiles.
//! Every instruction that can hand execution back to the interpreter
//! carries a [`FrameState`] describing the interpreter frame in terms of IR
//! registers, from which the code generator derives deoptimization
//! metadata.
//!
//! - [`types`]: the type lattice
//! - [`register`]: virtual registers and their environment
//! - [`opcode`], [`instr`]: instruction kinds and instructions
//! - [`block`], [`function`]: basic blocks, the CFG and functions
//! - [`frame_state`]: interpreter-visible state snapshots
//! - [`validate`]: structural checks run before code generation
//! - [`printer`]: textual form

pub mod block;
pub mod frame_state;
pub mod function;
pub mod instr;
pub mod opcode;
pub mod printer;
pub mod register;
pub mod types;
pub mod validate;

pub use block::{BasicBlock, BlockId};
pub use frame_state::{BlockStack, ExecutionBlock, FrameState, HandlerKind, OperandStack};
pub use function::{Cfg, Function, InstrRef};
pub use instr::{DeoptInfo, Instr, RefKind, RegState, ValueKind};
pub use opcode::{BinaryOpKind, CompareOp, InstrKind, Opcode};
pub use register::{Environment, RegId, Register};
pub use types::{Spec, Type};
pub use validate::{validate_function, IrError};
