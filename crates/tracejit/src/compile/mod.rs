//! Trace-capture compilation of array functions.
//!
//! A call to a [`Compiled`] function extracts a [`Signature`] from its
//! arguments and declared input state, looks it up in the function's cache
//! partition, traces and optimizes on a miss, and finally binds the cached
//! graph to the live arrays.

mod binder;
pub mod cache;
mod function;
pub mod graph;
mod signature;
mod state;
mod trace;
mod tree;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

use crate::backend::optimizer::{default_optimizer, OptimizeContext};
use crate::env;
use crate::profiling;
use crate::tensor::Array;

pub use cache::{CacheStats, Partition};
pub use function::{Function, FunctionId};
pub use graph::CompiledGraph;
pub use signature::{ArrayDescriptor, Signature};
pub use state::State;
pub use tree::{format_path, Args, Constant, Leaf, Opaque, PathSegment, Tree, TreeDef, TreePath};

static COMPILE_ENABLED: Lazy<AtomicBool> =
    Lazy::new(|| AtomicBool::new(!env::compile_disabled_by_env()));

/// Resumes cached compilation for every compiled function.
pub fn enable_compile() {
    COMPILE_ENABLED.store(true, Ordering::SeqCst);
}

/// Makes every compiled function call its original body directly. Cached
/// graphs are kept and reused after [`enable_compile`].
pub fn disable_compile() {
    COMPILE_ENABLED.store(false, Ordering::SeqCst);
}

pub fn compile_enabled() -> bool {
    COMPILE_ENABLED.load(Ordering::SeqCst)
}

/// Options of [`compile`].
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Containers whose array leaves are read as implicit inputs.
    pub inputs: Vec<State>,
    /// Containers whose written leaves are implicit outputs.
    pub outputs: Vec<State>,
    /// Key graphs by dtype and rank only and re-infer shapes on every bind.
    pub shapeless: bool,
}

impl CompileOptions {
    pub fn shapeless() -> Self {
        Self {
            shapeless: true,
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, states: impl IntoIterator<Item = State>) -> Self {
        self.inputs.extend(states);
        self
    }

    pub fn with_outputs(mut self, states: impl IntoIterator<Item = State>) -> Self {
        self.outputs.extend(states);
        self
    }

    /// Declares `state` as both input and output.
    pub fn with_state(self, state: State) -> Self {
        self.with_inputs([state.clone()]).with_outputs([state])
    }
}

struct CompiledInner {
    function: Function,
    options: CompileOptions,
    partition: Arc<Partition>,
}

/// A function wrapped with the compile cache. Clones share the cache.
#[derive(Clone)]
pub struct Compiled {
    inner: Arc<CompiledInner>,
}

/// Wraps `function` so calls reuse traced graphs keyed by their signature.
pub fn compile(function: &Function, options: CompileOptions) -> Compiled {
    Compiled {
        inner: Arc::new(CompiledInner {
            function: function.clone(),
            partition: cache::partition_for(function.id()),
            options,
        }),
    }
}

pub fn compile_default(function: &Function) -> Compiled {
    compile(function, CompileOptions::default())
}

fn optimize(mut graph: CompiledGraph) -> CompiledGraph {
    let before = graph.nodes.len();
    let cx = OptimizeContext::new(graph.shapeless);
    let result = default_optimizer().optimize(&mut graph, &cx);
    log::debug!(
        "optimized {}: {before} -> {} nodes ({} rewrites, {} erased)",
        graph.name,
        graph.nodes.len(),
        result.rewrites_applied,
        result.erased_nodes
    );
    graph
}

impl Compiled {
    pub fn function(&self) -> &Function {
        &self.inner.function
    }

    pub fn options(&self) -> &CompileOptions {
        &self.inner.options
    }

    /// Calls the function through the cache, or directly while compilation is disabled.
    pub fn call(&self, args: Args) -> Result<Tree> {
        let CompiledInner {
            function,
            options,
            partition,
        } = &*self.inner;
        if !compile_enabled() {
            return function.call(&args);
        }
        let _scope = profiling::compile_scope("call");
        let (signature, leaves) =
            signature::extract(function.id(), options.shapeless, &args, &options.inputs)?;
        let trace_and_optimize = || -> Result<CompiledGraph> {
            let graph = trace::trace(trace::TraceRequest {
                function,
                args: &args,
                leaves: &leaves,
                inputs: &options.inputs,
                outputs: &options.outputs,
                shapeless: options.shapeless,
            })?;
            Ok(optimize(graph))
        };
        let inputs = leaves.input_arrays();
        let mut graph = partition.get_or_trace(&signature, &trace_and_optimize)?;
        let shapes: Vec<&[usize]> = inputs.iter().map(Array::shape).collect();
        if !graph.accepts_extents(&shapes) {
            log::debug!("{} was traced for other extents; using exact shapes", function.name());
            let exact = signature.with_exact_extents(&leaves);
            graph = partition.get_or_trace(&exact, &trace_and_optimize)?;
        }
        binder::bind(&graph, &inputs, &options.outputs)
            .with_context(|| format!("while calling compiled {}", function.name()))
    }

    /// Calls with array arguments and returns the array leaves of the result.
    pub fn call_arrays(&self, inputs: &[Array]) -> Result<Vec<Array>> {
        let args = Args::new(inputs.iter().map(Tree::from).collect());
        Ok(self.call(args)?.arrays())
    }

    /// A plain [`Function`] that routes through this compiled wrapper, for
    /// use with transforms or as the body of another compiled function.
    pub fn as_function(&self) -> Function {
        let compiled = self.clone();
        Function::named(self.inner.function.name(), move |args| compiled.call(args.clone()))
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.partition.stats()
    }

    /// Cache key a call with `args` would use, given the current input state.
    pub fn signature(&self, args: &Args) -> Result<Signature> {
        let options = &self.inner.options;
        let (signature, _) = signature::extract(
            self.inner.function.id(),
            options.shapeless,
            args,
            &options.inputs,
        )?;
        Ok(signature)
    }

    /// Cached graph for `args` without tracing, for diagnostics.
    pub fn cached_graph(&self, args: &Args) -> Result<Option<Arc<CompiledGraph>>> {
        let signature = self.signature(args)?;
        Ok(cache::lookup(self.inner.function.id(), &signature))
    }
}

impl std::fmt::Debug for Compiled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiled")
            .field("function", &self.inner.function)
            .field("shapeless", &self.inner.options.shapeless)
            .finish()
    }
}
