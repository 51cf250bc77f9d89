pub mod fusion;
pub mod hashing;
pub mod optimizer;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod shape_helpers;
pub mod spec;
