extern crate self as tracejit;

pub mod backend;
pub mod compile;
mod env;
pub mod error;
pub mod export;
pub mod profiling;
pub mod tensor;
pub mod transforms;

pub use backend::spec::{DType, PortableBackend};
pub use compile::{
    compile, compile_default, compile_enabled, disable_compile, enable_compile, Args, Compiled,
    CompileOptions, Constant, Function, State, Tree,
};
pub use error::CompileError;
pub use export::{export_arrays_to_dot, export_to_dot};
pub use tensor::{eval, eval_all, Array};
pub use transforms::{grad, grad_argnums, jvp, value_and_grad, vjp, vmap};
