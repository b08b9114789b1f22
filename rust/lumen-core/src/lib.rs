//! Lumen Core
//!
//! Shared runtime data used by the JIT IR, the code generator and the
//! deoptimization runtime: the reference-counted object heap, bytecode unit
//! descriptions, string interning and the compile serialization section.

pub mod code;
pub mod strings;
pub mod sync;
pub mod values;

pub use code::{BcOffset, CodeId, CodeKind, CodeUnit};
pub use values::{ClassId, Heap, ObjRef, Object};
