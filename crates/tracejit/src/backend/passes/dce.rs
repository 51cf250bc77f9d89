use std::collections::{HashMap, HashSet};

use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::backend::spec::ValueId;
use crate::compile::CompiledGraph;

/// Removes nodes that no graph output depends on. Graph inputs are kept so
/// the binder can still match them positionally.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl FunctionPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut CompiledGraph, _cx: &OptimizeContext) -> PassResult {
        let mut def_map: HashMap<ValueId, usize> = HashMap::with_capacity(graph.nodes.len());
        for (idx, node) in graph.nodes.iter().enumerate() {
            def_map.insert(node.id, idx);
        }

        let mut worklist: Vec<ValueId> = graph.outputs.clone();
        let mut live: HashSet<ValueId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            worklist.extend(graph.nodes[idx].operands.iter().copied());
        }

        let before = graph.nodes.len();
        graph.nodes.retain(|node| live.contains(&node.id));
        let removed = before.saturating_sub(graph.nodes.len());

        PassResult {
            changed: removed > 0,
            iterations: 1,
            rewrites_applied: 0,
            erased_nodes: removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, TensorSpec,
    };
    use crate::compile::graph::InputRole;

    #[test]
    fn unused_nodes_are_removed_and_inputs_kept() {
        let mut graph = CompiledGraph::new("dce", false);
        let spec = TensorSpec::concrete(DType::F32, &[3]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let unused = graph.add_input(spec.clone(), InputRole::Arg(1));
        let dead = graph.push_node(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
            vec![unused],
            spec.clone(),
        );
        let live = graph.push_node(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![x, x],
            spec,
        );
        graph.outputs.push(live);

        let stats = DeadCodeEliminationPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(stats.changed);
        assert_eq!(stats.erased_nodes, 1);
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.nodes.iter().all(|node| node.id != dead));
        assert_eq!(graph.inputs.len(), 2);
    }
}
