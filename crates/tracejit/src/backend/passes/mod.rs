//! Optimization passes run over traced graphs before they are cached.

mod broadcast_canonicalization;
mod cse;
mod dce;
mod elementwise_fusion;

pub use broadcast_canonicalization::{
    BroadcastCanonicalizationPass, CollapseBroadcastChain, EliminateIdentityBroadcast,
    EliminateIdentityCast, EliminateIdentityReshape, GraphRewritePattern,
};
pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadCodeEliminationPass;
pub use elementwise_fusion::ElementwiseFusionPass;

pub use crate::backend::optimizer::{FunctionPass, PassResult as FunctionPassResult};
