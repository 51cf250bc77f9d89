//! Binds live arrays to a cached graph and rebuilds the caller-visible outputs.

use std::collections::HashMap;

use anyhow::{anyhow, ensure, Context, Result};

use crate::backend::shape_helpers::infer_spec;
use crate::backend::spec::{TensorSpec, ValueId};
use crate::compile::graph::{CompiledGraph, OutputSlot};
use crate::compile::state::State;
use crate::compile::tree::{Leaf, Tree};
use crate::tensor::Array;

/// Instantiates `graph` over `inputs` as lazy arrays. Evaluation stays
/// deferred to the next barrier. Shapeless graphs re-infer every node spec
/// from the bound extents, which is where incompatible shapes are reported.
pub(crate) fn bind(graph: &CompiledGraph, inputs: &[Array], outputs: &[State]) -> Result<Tree> {
    ensure!(
        inputs.len() == graph.inputs.len(),
        "graph {} expects {} inputs, got {}",
        graph.name,
        graph.inputs.len(),
        inputs.len()
    );

    let mut values: HashMap<ValueId, Array> =
        HashMap::with_capacity(graph.inputs.len() + graph.nodes.len());
    for (input, array) in graph.inputs.iter().zip(inputs) {
        values.insert(input.id, array.clone());
    }
    if graph.shapeless && log::log_enabled!(log::Level::Trace) {
        for dim in &graph.dynamic_dims {
            if let Some(extent) = inputs.get(dim.input).and_then(|a| a.shape().get(dim.axis)) {
                log::trace!("{}: ?{} = {extent}", graph.name, dim.symbol.as_str());
            }
        }
    }

    for node in &graph.nodes {
        let operands = node
            .operands
            .iter()
            .map(|operand| {
                values
                    .get(operand)
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!("graph {} reads undefined value %{}", graph.name, operand.0)
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let spec = if graph.shapeless {
            let operand_specs: Vec<TensorSpec> =
                operands.iter().map(|a| a.spec().clone()).collect();
            infer_spec(&node.op, &operand_specs)
                .with_context(|| format!("while binding {} to new input shapes", graph.name))?
        } else {
            node.spec.clone()
        };
        let array = Array::from_node_with_spec(node.op.clone(), operands, spec);
        values.insert(node.id, array);
    }

    let results = graph
        .outputs
        .iter()
        .map(|value| {
            values
                .get(value)
                .cloned()
                .ok_or_else(|| anyhow!("graph {} has no value for output %{}", graph.name, value.0))
        })
        .collect::<Result<Vec<_>>>()?;
    let leaf_for = |slot: &OutputSlot| -> Result<Leaf> {
        match slot {
            OutputSlot::Value(idx) => results
                .get(*idx)
                .cloned()
                .map(Leaf::Array)
                .ok_or_else(|| anyhow!("output slot {idx} out of range")),
            OutputSlot::Literal(leaf) => Ok(leaf.clone()),
        }
    };

    let interface = &graph.interface;
    let leaves = interface
        .output_slots
        .iter()
        .map(leaf_for)
        .collect::<Result<Vec<_>>>()?;
    let tree = Tree::unflatten(&interface.output_def, leaves)?;

    for write in &interface.state_writes {
        let state = outputs.get(write.state).ok_or_else(|| {
            anyhow!("graph {} writes undeclared output state {}", graph.name, write.state)
        })?;
        state.set_path(&write.path, Tree::Leaf(leaf_for(&write.slot)?))?;
    }
    Ok(tree)
}
