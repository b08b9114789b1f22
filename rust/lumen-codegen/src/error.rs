//! Code generation errors.

use std::collections::TryReserveError;

use thiserror::Error;

use lumen_hir::IrError;

/// Errors that abort compilation of one unit. The unit falls back to the
/// interpreter; other units are unaffected.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("invalid IR: {0}")]
    Validation(#[from] IrError),

    #[error("out of memory building deopt metadata: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("unsupported machine location: {0}")]
    UnsupportedLocation(String),
}
