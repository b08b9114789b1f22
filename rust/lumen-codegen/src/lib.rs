//! Lumen deoptimization code generation.
//!
//! Turns validated HIR into the artifacts the runtime needs to hand
//! execution back to the interpreter: one [`DeoptMetadata`] per deopt site,
//! with machine locations assigned to every live value. Native code emission
//! itself happens elsewhere; this crate owns the contract between the IR and
//! the deoptimization runtime.

pub mod compile;
pub mod deopt;
pub mod error;
pub mod layout;

pub use compile::{compile_function, compile_parallel, CodegenSettings, CompiledUnit};
pub use deopt::{
    build_deopt_metadata, DeoptFrameMetadata, DeoptMetadata, DeoptNonce, DeoptReason, LiveValue,
    Location, MetadataBuilder, PhysReg, StackEntry, ValueSource, DEAD_SLOT,
};
pub use error::CodegenError;
pub use layout::{assign_locations, FrameLayout, WORD_SIZE};
