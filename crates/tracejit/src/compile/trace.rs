//! Trace capture: runs a function once over placeholders and records the
//! operations that connect them to its outputs.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};

use crate::backend::shape_helpers::resolve_index;
use crate::backend::spec::{DimSymbol, Dimension, Operation, Shape, TensorSpec, ValueId};
use crate::compile::function::Function;
use crate::compile::graph::{
    CompiledGraph, DynamicDim, GraphInterface, InputRole, OutputSlot, StateWrite,
};
use crate::compile::signature::CallLeaves;
use crate::compile::state::{State, StateRestore};
use crate::compile::tree::{Args, Leaf, Tree, TreePath};
use crate::error::CompileError;
use crate::profiling;
use crate::tensor::{eval_all, Array, ArrayId, Source, TraceId};

pub(crate) struct TraceRequest<'a> {
    pub function: &'a Function,
    pub args: &'a Args,
    pub leaves: &'a CallLeaves,
    pub inputs: &'a [State],
    pub outputs: &'a [State],
    pub shapeless: bool,
}

struct Placeholders {
    trace: TraceId,
    bindings: HashMap<ArrayId, ValueId>,
    real_inputs: HashSet<ArrayId>,
}

impl Placeholders {
    fn substitute(&mut self, graph: &mut CompiledGraph, array: &Array, role: InputRole) -> Array {
        let index = graph.inputs.len();
        let spec = array.spec().clone();
        let graph_spec = if graph.shapeless {
            let dims = (0..array.ndim())
                .map(|axis| {
                    let symbol = DimSymbol::new(format!("s{index}_{axis}"));
                    graph.dynamic_dims.push(DynamicDim {
                        symbol: symbol.clone(),
                        input: index,
                        axis,
                    });
                    Dimension::Dynamic(symbol)
                })
                .collect::<Vec<_>>();
            TensorSpec::new(spec.dtype, Shape::new(dims))
        } else {
            spec.clone()
        };
        let value = graph.add_input(graph_spec, role);
        let placeholder = Array::placeholder(self.trace, index, spec);
        self.bindings.insert(placeholder.id(), value);
        self.real_inputs.insert(array.id());
        placeholder
    }
}

/// Leaves of every output state that were written during the call.
fn state_writes(
    outputs: &[State],
    before: &[Vec<(TreePath, Leaf)>],
) -> Vec<(usize, TreePath, Leaf)> {
    let mut writes = Vec::new();
    for (index, state) in outputs.iter().enumerate() {
        let prior: HashMap<&TreePath, &Leaf> = before[index].iter().map(|(p, l)| (p, l)).collect();
        for (path, leaf) in state.leaves_with_paths() {
            let changed = match (prior.get(&path), &leaf) {
                (Some(Leaf::Array(old)), Leaf::Array(new)) => old.id() != new.id(),
                (Some(Leaf::Constant(old)), Leaf::Constant(new)) => old != new,
                (Some(Leaf::Opaque(_)), Leaf::Opaque(_)) => false,
                _ => true,
            };
            if changed {
                writes.push((index, path, leaf));
            }
        }
    }
    writes
}

/// Traces `request.function` into an unoptimized graph.
pub(crate) fn trace(request: TraceRequest<'_>) -> Result<CompiledGraph> {
    let _scope = profiling::compile_scope("trace");
    let TraceRequest {
        function,
        args,
        leaves,
        inputs,
        outputs,
        shapeless,
    } = request;

    let mut graph = CompiledGraph::new(function.name(), shapeless);
    let mut placeholders = Placeholders {
        trace: TraceId::next(),
        bindings: HashMap::new(),
        real_inputs: HashSet::new(),
    };

    let mut arg_index = 0usize;
    let traced_leaves = leaves
        .arg_leaves
        .iter()
        .map(|leaf| match leaf {
            Leaf::Array(array) => {
                let role = InputRole::Arg(arg_index);
                arg_index += 1;
                Leaf::Array(placeholders.substitute(&mut graph, array, role))
            }
            other => other.clone(),
        })
        .collect::<Vec<_>>();
    let traced_args = Args::from_tree(Tree::unflatten(&leaves.arg_def, traced_leaves)?)?;
    debug_assert_eq!(args.len(), traced_args.len());

    let touched: Vec<&State> = inputs.iter().chain(outputs.iter()).collect();
    let restore = StateRestore::capture(&touched);
    for (state_index, state) in inputs.iter().enumerate() {
        let mut leaf_index = 0usize;
        for (path, leaf) in &leaves.state_leaves[state_index] {
            if let Leaf::Array(array) = leaf {
                let role = InputRole::State {
                    state: state_index,
                    leaf: leaf_index,
                };
                leaf_index += 1;
                let placeholder = placeholders.substitute(&mut graph, array, role);
                state.set_path(path, placeholder)?;
            }
        }
    }
    let before: Vec<Vec<(TreePath, Leaf)>> =
        outputs.iter().map(State::leaves_with_paths).collect();

    let result = function
        .call(&traced_args)
        .with_context(|| format!("while tracing {}", function.name()))?;
    let writes = state_writes(outputs, &before);
    drop(restore);

    let mut output_arrays: Vec<Array> = Vec::new();
    let mut slot_for = |leaf: Leaf| match leaf {
        Leaf::Array(array) => {
            output_arrays.push(array);
            OutputSlot::Value(output_arrays.len() - 1)
        }
        other => OutputSlot::Literal(other),
    };
    let (result_leaves, output_def) = result.flatten();
    let output_slots: Vec<OutputSlot> = result_leaves.into_iter().map(&mut slot_for).collect();
    let state_writes: Vec<StateWrite> = writes
        .into_iter()
        .map(|(state, path, leaf)| StateWrite {
            state,
            path,
            slot: slot_for(leaf),
        })
        .collect();

    graph.outputs = record_nodes(&mut graph, &placeholders, &output_arrays)?;
    if shapeless {
        let extents: Vec<Vec<usize>> = leaves
            .input_arrays()
            .iter()
            .map(|array| array.shape().to_vec())
            .collect();
        if enumerates_an_axis(&graph, &extents) {
            log::debug!(
                "{} takes every index of a dynamic axis; keyed by exact extents",
                function.name()
            );
            graph.specialized_extents = Some(extents);
        }
    }
    graph.interface = GraphInterface {
        output_def,
        output_slots,
        state_writes,
    };
    log::debug!(
        "traced {} ({}): {} inputs, {} nodes, {} outputs",
        function.name(),
        function.id(),
        graph.inputs.len(),
        graph.nodes.len(),
        graph.outputs.len()
    );
    Ok(graph)
}

/// True when some value has every position along one axis taken by
/// separate `Take` nodes, so the node count is tied to that extent.
fn enumerates_an_axis(graph: &CompiledGraph, input_extents: &[Vec<usize>]) -> bool {
    let extent_of = |value: ValueId, axis: usize| -> Option<usize> {
        match graph.inputs.iter().position(|input| input.id == value) {
            Some(pos) => input_extents.get(pos)?.get(axis).copied(),
            None => graph
                .nodes
                .iter()
                .find(|node| node.id == value)?
                .spec
                .shape
                .static_dims()?
                .get(axis)
                .copied(),
        }
    };
    let mut taken: HashMap<(ValueId, usize), BTreeSet<usize>> = HashMap::new();
    for node in &graph.nodes {
        let (Operation::Take(spec), [operand]) = (&node.op, node.operands.as_slice()) else {
            continue;
        };
        let Some(extent) = extent_of(*operand, spec.axis) else {
            continue;
        };
        if let Some(index) = resolve_index(spec.index, extent) {
            taken.entry((*operand, spec.axis)).or_default().insert(index);
        }
    }
    taken
        .iter()
        .any(|((operand, axis), indices)| extent_of(*operand, *axis) == Some(indices.len()))
}

#[derive(Clone, Copy)]
enum Class {
    /// Depends on a placeholder of this trace.
    Traced,
    /// Independent of the call; embedded as a constant.
    Free,
}

/// Walks back from `outputs`, emitting graph nodes in producer-before-consumer order.
fn record_nodes(
    graph: &mut CompiledGraph,
    placeholders: &Placeholders,
    outputs: &[Array],
) -> Result<Vec<ValueId>> {
    let mut classes: HashMap<ArrayId, Class> = HashMap::new();
    let mut order: Vec<Array> = Vec::new();
    let mut visiting: HashSet<ArrayId> = HashSet::new();
    let mut stack: Vec<(Array, bool)> = outputs.iter().rev().map(|a| (a.clone(), false)).collect();

    while let Some((array, expanded)) = stack.pop() {
        let id = array.id();
        if !expanded && (classes.contains_key(&id) || !visiting.insert(id)) {
            continue;
        }
        if placeholders.bindings.contains_key(&id) {
            classes.insert(id, Class::Traced);
            continue;
        }
        if placeholders.real_inputs.contains(&id) {
            return Err(CompileError::UnboundLeaf {
                detail: format!(
                    "array {array:?} is read through a closure but is also a call argument; \
                     use the argument or declare it as input state"
                ),
            }
            .into());
        }
        match array.source() {
            Source::Placeholder { .. } => {
                return Err(CompileError::UnboundLeaf {
                    detail: format!("array {array:?} belongs to a different trace"),
                }
                .into())
            }
            Source::Data => {
                classes.insert(id, Class::Free);
            }
            Source::Node { .. } if array.is_evaluated() => {
                classes.insert(id, Class::Free);
            }
            Source::Node { inputs, .. } => {
                if expanded {
                    let traced = inputs
                        .iter()
                        .any(|input| matches!(classes.get(&input.id()), Some(Class::Traced)));
                    let class = if traced { Class::Traced } else { Class::Free };
                    classes.insert(id, class);
                    if traced {
                        order.push(array);
                    }
                } else {
                    let pending: Vec<Array> = inputs
                        .iter()
                        .rev()
                        .filter(|input| {
                            !classes.contains_key(&input.id()) && !visiting.contains(&input.id())
                        })
                        .cloned()
                        .collect();
                    stack.push((array, true));
                    stack.extend(pending.into_iter().map(|input| (input, false)));
                }
            }
        }
    }

    // Free arrays feeding traced nodes or returned directly become constants.
    let mut frozen: Vec<Array> = Vec::new();
    let mut seen: HashSet<ArrayId> = HashSet::new();
    let operands = order.iter().flat_map(|node| node.inputs().iter());
    for array in operands.chain(outputs.iter()) {
        if matches!(classes.get(&array.id()), Some(Class::Free)) && seen.insert(array.id()) {
            frozen.push(array.clone());
        }
    }
    eval_all(&frozen).context("while freezing captured arrays")?;

    let mut values: HashMap<ArrayId, ValueId> = placeholders.bindings.clone();
    for array in &frozen {
        let literal = array.to_literal()?;
        let value = graph.push_node(Operation::Constant(literal), Vec::new(), array.spec().clone());
        values.insert(array.id(), value);
    }
    for array in &order {
        let (Some(op), inputs) = (array.op(), array.inputs()) else {
            continue;
        };
        let operands = inputs
            .iter()
            .map(|input| {
                values.get(&input.id()).copied().ok_or_else(|| CompileError::UnboundLeaf {
                    detail: format!("operand {input:?} was not recorded"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let value = graph.push_node(op.clone(), operands, array.spec().clone());
        values.insert(array.id(), value);
    }

    outputs
        .iter()
        .map(|array| {
            values.get(&array.id()).copied().ok_or_else(|| {
                CompileError::UnboundLeaf {
                    detail: format!("output {array:?} was not recorded"),
                }
                .into()
            })
        })
        .collect()
}
