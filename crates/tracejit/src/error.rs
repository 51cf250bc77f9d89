use thiserror::Error;

/// Errors raised by signature extraction, tracing and binding.
///
/// Every variant is terminal for the call that raised it and never leaves a
/// cache entry behind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// A leaf with no structural equality contract was passed to a compiled call.
    #[error("unsupported argument at {path}: values of type {type_name} cannot be part of a compile signature")]
    UnsupportedArgument { path: String, type_name: String },

    /// Shapes cannot be reconciled with the recorded operation.
    #[error("shape error in {op}: {detail}")]
    Shape { op: String, detail: String },

    /// The traced function read an array that is neither an input nor captured state.
    #[error("unbound leaf: {detail}")]
    UnboundLeaf { detail: String },

    /// Evaluation was forced on a value derived from a trace placeholder.
    #[error("cannot evaluate an array that depends on a traced placeholder; declare it as an output instead")]
    EvalDuringTrace,

    /// The argument structure could not be encoded into a cache key.
    #[error("cannot fingerprint argument structure: {0}")]
    Fingerprint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CompileError {
    pub fn shape(op: impl Into<String>, detail: impl Into<String>) -> Self {
        CompileError::Shape {
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        CompileError::InvalidArgument(detail.into())
    }
}
