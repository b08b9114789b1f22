//! Lumen RT: the deoptimization runtime.
//!
//! Hands execution of compiled units back to the interpreter. Given a deopt
//! id and the machine state captured at the trap, the runtime rebuilds the
//! interpreter frames described by the unit's metadata, settles reference
//! ownership between the native frame and the rebuilt frames, and links the
//! frames into the interpreter's call chain. Compiled generators keep their
//! state in a per-generator footer between suspensions.
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod materialize;
pub mod runtime;

pub use config::JitConfig;
pub use error::RuntimeError;
pub use frame::{CallChain, FrameId, FrameStatus, InterpreterFrame, MachineSnapshot};
pub use materialize::{materialize_frames, release_native_references};
pub use runtime::{
    CodeRuntime, DeoptId, DeoptStats, GeneratorFooter, GeneratorResume, Runtime, UnitId,
};
