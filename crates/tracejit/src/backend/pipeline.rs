use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::optimizer::{FunctionPass, OptimizeContext, Optimizer, PassResult};
use crate::backend::passes::{
    BroadcastCanonicalizationPass, CommonSubexpressionEliminationPass, DeadCodeEliminationPass,
    ElementwiseFusionPass,
};
use crate::compile::CompiledGraph;

const CLEANUP_ITERS: usize = 4;

pub enum Step {
    Pass(Arc<dyn FunctionPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn FunctionPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs dead-node elimination, CSE and broadcast canonicalization to a
/// fixed point, then fuses elementwise chains and cleans up once more.
pub struct PipelineOptimizer {
    steps: Vec<Step>,
    log_stats: bool,
    run_counter: AtomicUsize,
}

impl PipelineOptimizer {
    pub fn new() -> Self {
        let mut builder = PipelineBuilder::new();
        builder.fixed_point(CLEANUP_ITERS, |p| {
            p.pass(Arc::new(BroadcastCanonicalizationPass));
            p.pass(Arc::new(DeadCodeEliminationPass));
            p.pass(Arc::new(CommonSubexpressionEliminationPass));
            p.pass(Arc::new(DeadCodeEliminationPass));
        });
        builder.pass(Arc::new(ElementwiseFusionPass));
        builder.pass(Arc::new(DeadCodeEliminationPass));
        Self::from_steps(builder.finish())
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            log_stats: crate::env::pass_stats_enabled(),
            run_counter: AtomicUsize::new(0),
        }
    }
}

impl Default for PipelineOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer for PipelineOptimizer {
    fn optimize(&self, graph: &mut CompiledGraph, cx: &OptimizeContext) -> PassResult {
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed);
        let mut result = PassResult::default();
        run_steps(&self.steps, graph, cx, run_id, &mut result, self.log_stats);
        result
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut CompiledGraph,
    cx: &OptimizeContext,
    run_id: usize,
    totals: &mut PassResult,
    log_stats: bool,
) -> bool {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let _scope = crate::profiling::compile_pass_scope(pass.name());
                let stats = pass.run(graph, cx);
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if log_stats {
                    log::trace!(
                        "run {run_id} {}: pass {} changed={} rewrites={} erased={} nodes={}",
                        graph.name,
                        pass.name(),
                        stats.changed,
                        stats.rewrites_applied,
                        stats.erased_nodes,
                        graph.nodes.len()
                    );
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                while iter < *max_iters {
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, run_id, &mut local, log_stats);
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    changed_any
}
