//! Graph optimization infrastructure: a context-aware pass trait and an
//! optimizer that runs a pipeline of passes once per trace.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::backend::pipeline::PipelineOptimizer;
use crate::compile::CompiledGraph;
use crate::env;

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of rewrite iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Nodes removed by the pass.
    pub erased_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// Facts about the graph being optimized that passes must respect.
#[derive(Debug, Clone, Copy)]
pub struct OptimizeContext {
    shapeless: bool,
    max_fused_inputs: usize,
}

impl OptimizeContext {
    pub fn new(shapeless: bool) -> Self {
        Self {
            shapeless,
            max_fused_inputs: env::max_fused_inputs(),
        }
    }

    pub fn with_max_fused_inputs(mut self, limit: usize) -> Self {
        self.max_fused_inputs = limit.max(1);
        self
    }

    /// Recorded extents are only valid for the traced call; passes must not
    /// rely on concrete dims when this is set.
    pub fn shapeless(&self) -> bool {
        self.shapeless
    }

    pub fn max_fused_inputs(&self) -> usize {
        self.max_fused_inputs
    }
}

/// Canonical interface implemented by optimization passes.
pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut CompiledGraph, cx: &OptimizeContext) -> PassResult;
}

/// Trait implemented by optimizers invoked before graphs are cached.
pub trait Optimizer: Send + Sync {
    fn optimize(&self, graph: &mut CompiledGraph, cx: &OptimizeContext) -> PassResult;
}

static DEFAULT_OPTIMIZER: Lazy<Arc<dyn Optimizer>> =
    Lazy::new(|| Arc::new(PipelineOptimizer::new()));

/// Shared instance of the standard pipeline.
pub fn default_optimizer() -> Arc<dyn Optimizer> {
    Arc::clone(&DEFAULT_OPTIMIZER)
}
