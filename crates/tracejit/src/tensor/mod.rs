mod array;
pub mod eval;
mod ops;

pub use array::{Array, ArrayId, TraceId};
pub(crate) use array::Source;
pub use eval::{eval, eval_all};
