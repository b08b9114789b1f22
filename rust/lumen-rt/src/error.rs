//! Recoverable runtime errors.

use std::path::PathBuf;

use thiserror::Error;

use lumen_codegen::CodegenError;
use lumen_core::values::ObjRef;

use crate::runtime::{DeoptId, UnitId};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown deopt metadata id {0}")]
    UnknownDeopt(DeoptId),

    #[error("unknown compiled unit {0}")]
    UnknownUnit(UnitId),

    #[error("generator {0} has no native footer")]
    UnknownGenerator(ObjRef),

    #[error("generator {0} is not suspended")]
    GeneratorNotSuspended(ObjRef),

    #[error("deopt metadata {nonce} has live values without a machine location")]
    UnlocatedMetadata { nonce: u64 },

    #[error("compilation failed: {0}")]
    Compile(#[from] CodegenError),

    #[error("failed to read {}: {source}", .path.display())]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
