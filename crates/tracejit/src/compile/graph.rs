//! Compiled graph IR produced by one trace and reused by every cache hit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::spec::{format_spec, write_line, DimSymbol, Operation, TensorSpec, ValueId};
use crate::compile::tree::{Leaf, TreeDef, TreePath};

static LIVE_GRAPHS: AtomicUsize = AtomicUsize::new(0);

/// Number of compiled graphs currently alive in the process.
pub fn live_graphs() -> usize {
    LIVE_GRAPHS.load(Ordering::SeqCst)
}

/// Counts one live graph for as long as it exists.
#[derive(Debug)]
struct LiveToken;

impl LiveToken {
    fn new() -> Self {
        LIVE_GRAPHS.fetch_add(1, Ordering::SeqCst);
        LiveToken
    }
}

impl Clone for LiveToken {
    fn clone(&self) -> Self {
        LiveToken::new()
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        LIVE_GRAPHS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where the value bound to a graph input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    /// Array leaf `index` of the call arguments.
    Arg(usize),
    /// Array leaf `leaf` of declared input state `state`.
    State { state: usize, leaf: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphInput {
    pub id: ValueId,
    /// Traced spec; dims are symbolic for shapeless graphs.
    pub spec: TensorSpec,
    pub role: InputRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    /// Spec observed while tracing; shapeless graphs re-infer it on bind.
    pub spec: TensorSpec,
}

/// Dynamic dimension of a shapeless graph, resolved from an input extent.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDim {
    pub symbol: DimSymbol,
    pub input: usize,
    pub axis: usize,
}

/// Non-array content of an output position.
#[derive(Debug, Clone)]
pub enum OutputSlot {
    /// Index into [`CompiledGraph::outputs`].
    Value(usize),
    /// Returned verbatim on every call.
    Literal(Leaf),
}

/// Write into a declared output state, replayed after every call.
#[derive(Debug, Clone)]
pub struct StateWrite {
    pub state: usize,
    pub path: TreePath,
    pub slot: OutputSlot,
}

/// How graph outputs map back onto the caller's return tree and states.
#[derive(Debug, Clone)]
pub struct GraphInterface {
    pub output_def: TreeDef,
    pub output_slots: Vec<OutputSlot>,
    pub state_writes: Vec<StateWrite>,
}

impl GraphInterface {
    pub fn empty() -> Self {
        Self {
            output_def: TreeDef::Tuple(Vec::new()),
            output_slots: Vec::new(),
            state_writes: Vec::new(),
        }
    }
}

/// An optimized, immutable graph stored in a cache partition.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub name: String,
    pub inputs: Vec<GraphInput>,
    /// Topologically ordered.
    pub nodes: Vec<OperationNode>,
    pub outputs: Vec<ValueId>,
    pub shapeless: bool,
    pub dynamic_dims: Vec<DynamicDim>,
    /// Input extents a shapeless graph was traced with, set when its node
    /// count depends on them (every index of an input axis is taken).
    pub specialized_extents: Option<Vec<Vec<usize>>>,
    pub interface: GraphInterface,
    next_value: u32,
    _live: LiveToken,
}

impl CompiledGraph {
    pub fn new(name: impl Into<String>, shapeless: bool) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            shapeless,
            dynamic_dims: Vec::new(),
            specialized_extents: None,
            interface: GraphInterface::empty(),
            next_value: 0,
            _live: LiveToken::new(),
        }
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn add_input(&mut self, spec: TensorSpec, role: InputRole) -> ValueId {
        let id = self.fresh_value();
        self.inputs.push(GraphInput { id, spec, role });
        id
    }

    pub fn push_node(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        spec: TensorSpec,
    ) -> ValueId {
        let id = self.fresh_value();
        self.nodes.push(OperationNode {
            id,
            op,
            operands,
            spec,
        });
        id
    }

    /// Whether the graph can be bound to arrays of these shapes.
    pub fn accepts_extents(&self, shapes: &[&[usize]]) -> bool {
        match &self.specialized_extents {
            None => true,
            Some(extents) => {
                extents.len() == shapes.len()
                    && extents.iter().zip(shapes).all(|(dims, shape)| dims.as_slice() == *shape)
            }
        }
    }

    pub fn is_input(&self, value: ValueId) -> bool {
        self.inputs.iter().any(|input| input.id == value)
    }

    /// Spec of any value defined in the graph.
    pub fn value_spec(&self, value: ValueId) -> Option<&TensorSpec> {
        self.inputs
            .iter()
            .find(|input| input.id == value)
            .map(|input| &input.spec)
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|node| node.id == value)
                    .map(|node| &node.spec)
            })
    }

    /// Number of node operands and graph outputs reading each value.
    pub fn use_counts(&self) -> HashMap<ValueId, usize> {
        let mut counts: HashMap<ValueId, usize> = HashMap::new();
        for node in &self.nodes {
            for operand in &node.operands {
                *counts.entry(*operand).or_default() += 1;
            }
        }
        for output in &self.outputs {
            *counts.entry(*output).or_default() += 1;
        }
        counts
    }

    /// Rewrites every use of `from` (operands and outputs) to `to`.
    pub fn replace_uses(&mut self, from: ValueId, to: ValueId) {
        for node in &mut self.nodes {
            for operand in &mut node.operands {
                if *operand == from {
                    *operand = to;
                }
            }
        }
        for output in &mut self.outputs {
            if *output == from {
                *output = to;
            }
        }
    }

    /// Counts nodes whose label equals `label`.
    pub fn count_label(&self, label: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.op.label() == label)
            .count()
    }
}

impl fmt::Display for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("func @{} {{", self.name))?;
        if !self.inputs.is_empty() {
            write_line(f, 1, "params:")?;
            for input in &self.inputs {
                write_line(
                    f,
                    2,
                    &format!("%{} : {}", input.id.0, format_spec(&input.spec)),
                )?;
            }
        }
        if !self.nodes.is_empty() {
            write_line(f, 1, "body:")?;
            for node in &self.nodes {
                let operands = node
                    .operands
                    .iter()
                    .map(|operand| format!("%{}", operand.0))
                    .collect::<Vec<_>>()
                    .join(", ");
                write_line(
                    f,
                    2,
                    &format!(
                        "%{} = {}({operands}) -> {}",
                        node.id.0,
                        node.op.label(),
                        format_spec(&node.spec)
                    ),
                )?;
            }
        }
        if !self.outputs.is_empty() {
            write_line(f, 1, "results:")?;
            for output in &self.outputs {
                let spec = self
                    .value_spec(*output)
                    .map(format_spec)
                    .unwrap_or_else(|| "?".to_string());
                write_line(f, 2, &format!("%{} : {spec}", output.0))?;
            }
        }
        write_line(f, 0, "}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, ElementwiseBinaryOp};

    #[test]
    fn display_lists_params_body_and_results() {
        let mut graph = CompiledGraph::new("add", false);
        let spec = TensorSpec::concrete(DType::F32, &[2, 2]);
        let a = graph.add_input(spec.clone(), InputRole::Arg(0));
        let b = graph.add_input(spec.clone(), InputRole::Arg(1));
        let sum = graph.push_node(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![a, b],
            spec,
        );
        graph.outputs.push(sum);
        let text = graph.to_string();
        assert!(text.starts_with("func @add {"));
        assert!(text.contains("%2 = Add(%0, %1) -> tensor<F32 x 2x2>"));
        assert!(text.contains("results:"));
        assert_eq!(graph.count_label("Add"), 1);
    }
}
