use std::collections::HashMap;

use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::backend::spec::ValueId;
use crate::compile::CompiledGraph;

/// Common-subexpression elimination.
///
/// Serializes `(op, operands, spec)` for every node and replaces later
/// duplicates with the first occurrence. Every operation is pure, so no node
/// is exempt.
#[derive(Default)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

impl FunctionPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut CompiledGraph, _cx: &OptimizeContext) -> PassResult {
        let mut seen: HashMap<Vec<u8>, ValueId> = HashMap::new();
        let mut duplicates: Vec<(ValueId, ValueId)> = Vec::new();
        let mut stats = PassResult::default();

        for node in &mut graph.nodes {
            stats.iterations += 1;
            // Earlier merges rewrite operands before the key is taken.
            for operand in &mut node.operands {
                if let Some((_, to)) = duplicates.iter().find(|(from, _)| *from == *operand) {
                    *operand = *to;
                }
            }
            let key = match bincode::serialize(&(&node.op, &node.operands, &node.spec)) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            match seen.get(&key) {
                Some(&existing) => duplicates.push((node.id, existing)),
                None => {
                    seen.insert(key, node.id);
                }
            }
        }

        if duplicates.is_empty() {
            return stats;
        }
        for (from, to) in &duplicates {
            graph.replace_uses(*from, *to);
        }
        let before = graph.nodes.len();
        graph
            .nodes
            .retain(|node| !duplicates.iter().any(|(from, _)| *from == node.id));
        stats.changed = true;
        stats.rewrites_applied = duplicates.len();
        stats.erased_nodes = before - graph.nodes.len();
        stats
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
    fn duplicate_chains_collapse_to_first_occurrence() {
        let mut graph = CompiledGraph::new("cse", false);
        let spec = TensorSpec::concrete(DType::F32, &[4]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let exp = Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp);
        let a = graph.push_node(exp.clone(), vec![x], spec.clone());
        let b = graph.push_node(exp, vec![x], spec.clone());
        let neg = Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg);
        let na = graph.push_node(neg.clone(), vec![a], spec.clone());
        let nb = graph.push_node(neg, vec![b], spec.clone());
        let sum = graph.push_node(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![na, nb],
            spec,
        );
        graph.outputs.push(sum);

        let stats =
            CommonSubexpressionEliminationPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(stats.changed);
        assert_eq!(stats.rewrites_applied, 2);
        assert_eq!(graph.nodes.len(), 3);
        let add = graph.nodes.last().expect("add survives");
        assert_eq!(add.operands, vec![na, na]);
    }

    #[test]
    fn distinct_operands_are_not_merged() {
        let mut graph = CompiledGraph::new("cse", false);
        let spec = TensorSpec::concrete(DType::F32, &[4]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let y = graph.add_input(spec.clone(), InputRole::Arg(1));
        let exp = Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp);
        let a = graph.push_node(exp.clone(), vec![x], spec.clone());
        let b = graph.push_node(exp, vec![y], spec);
        graph.outputs.extend([a, b]);

        let stats =
            CommonSubexpressionEliminationPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(!stats.changed);
        assert_eq!(graph.nodes.len(), 2);
    }
}
