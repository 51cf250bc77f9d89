use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::backend::spec::Operation;
use crate::compile::CompiledGraph;

const MAX_SWEEPS: usize = 8;

/// Local rewrite rooted at one node.
pub trait GraphRewritePattern: Send + Sync {
    /// Patterns that compare recorded extents are only valid for static graphs.
    fn shape_dependent(&self) -> bool;

    /// Rewrites the node at `idx`; returns `true` when the graph changed.
    fn match_and_rewrite(&self, graph: &mut CompiledGraph, idx: usize) -> bool;
}

/// Forwards the operand of node `idx` to its users and erases the node.
fn forward_operand(graph: &mut CompiledGraph, idx: usize) -> bool {
    let node = &graph.nodes[idx];
    let (from, to) = (node.id, node.operands[0]);
    graph.replace_uses(from, to);
    graph.nodes.remove(idx);
    true
}

fn same_shape_as_operand(graph: &CompiledGraph, idx: usize) -> bool {
    let node = &graph.nodes[idx];
    node.operands
        .first()
        .and_then(|operand| graph.value_spec(*operand))
        .is_some_and(|spec| spec.shape == node.spec.shape && spec.dtype == node.spec.dtype)
}

/// Removes broadcasts whose result has the operand's shape.
pub struct EliminateIdentityBroadcast;

impl GraphRewritePattern for EliminateIdentityBroadcast {
    fn shape_dependent(&self) -> bool {
        true
    }

    fn match_and_rewrite(&self, graph: &mut CompiledGraph, idx: usize) -> bool {
        if !graph.nodes[idx].op.is_broadcast() || !same_shape_as_operand(graph, idx) {
            return false;
        }
        forward_operand(graph, idx)
    }
}

/// Folds `broadcast_to(broadcast_to(x))` into a single broadcast from `x`.
pub struct CollapseBroadcastChain;

impl GraphRewritePattern for CollapseBroadcastChain {
    fn shape_dependent(&self) -> bool {
        true
    }

    fn match_and_rewrite(&self, graph: &mut CompiledGraph, idx: usize) -> bool {
        let node = &graph.nodes[idx];
        if !matches!(node.op, Operation::BroadcastTo(_)) {
            return false;
        }
        let inner_value = node.operands[0];
        let Some(inner) = graph.nodes.iter().find(|n| n.id == inner_value) else {
            return false;
        };
        if !matches!(inner.op, Operation::BroadcastTo(_)) {
            return false;
        }
        let base = inner.operands[0];
        graph.nodes[idx].operands[0] = base;
        true
    }
}

/// Removes reshapes that keep the operand's shape.
pub struct EliminateIdentityReshape;

impl GraphRewritePattern for EliminateIdentityReshape {
    fn shape_dependent(&self) -> bool {
        true
    }

    fn match_and_rewrite(&self, graph: &mut CompiledGraph, idx: usize) -> bool {
        let is_reshape = matches!(
            graph.nodes[idx].op,
            Operation::Reshape(_) | Operation::ReshapeLike
        );
        if !is_reshape || !same_shape_as_operand(graph, idx) {
            return false;
        }
        forward_operand(graph, idx)
    }
}

/// Removes casts to the operand's own dtype.
pub struct EliminateIdentityCast;

impl GraphRewritePattern for EliminateIdentityCast {
    fn shape_dependent(&self) -> bool {
        false
    }

    fn match_and_rewrite(&self, graph: &mut CompiledGraph, idx: usize) -> bool {
        let node = &graph.nodes[idx];
        let Operation::Cast(cast) = &node.op else {
            return false;
        };
        let same = graph
            .value_spec(node.operands[0])
            .is_some_and(|spec| spec.dtype == cast.dtype);
        same && forward_operand(graph, idx)
    }
}

/// Applies broadcast, reshape and cast simplifications greedily. Shapeless
/// graphs only get the rewrites that hold for every input extent.
pub struct BroadcastCanonicalizationPass;

impl BroadcastCanonicalizationPass {
    const NAME: &'static str = "broadcast-canonicalize";

    fn patterns() -> [&'static dyn GraphRewritePattern; 4] {
        [
            &EliminateIdentityBroadcast,
            &CollapseBroadcastChain,
            &EliminateIdentityReshape,
            &EliminateIdentityCast,
        ]
    }
}

impl FunctionPass for BroadcastCanonicalizationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut CompiledGraph, cx: &OptimizeContext) -> PassResult {
        let patterns: Vec<&dyn GraphRewritePattern> = Self::patterns()
            .into_iter()
            .filter(|pattern| !cx.shapeless() || !pattern.shape_dependent())
            .collect();
        let mut stats = PassResult::default();
        let before = graph.nodes.len();

        for _ in 0..MAX_SWEEPS {
            stats.iterations += 1;
            let mut applied = 0usize;
            let mut idx = 0usize;
            while idx < graph.nodes.len() {
                let len = graph.nodes.len();
                if patterns
                    .iter()
                    .any(|pattern| pattern.match_and_rewrite(graph, idx))
                {
                    applied += 1;
                    if graph.nodes.len() < len {
                        continue;
                    }
                }
                idx += 1;
            }
            stats.rewrites_applied += applied;
            if applied == 0 {
                break;
            }
        }

        stats.erased_nodes = before.saturating_sub(graph.nodes.len());
        stats.changed = stats.rewrites_applied > 0;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        BroadcastToSpec, DType, ElementwiseBinaryOp, ReshapeDim, ReshapeSpec, TensorSpec,
    };
    use crate::compile::graph::InputRole;

    fn broadcast(dims: &[usize]) -> Operation {
        Operation::BroadcastTo(BroadcastToSpec {
            result_shape: dims.to_vec(),
        })
    }

    #[test]
    fn identity_broadcast_and_reshape_are_forwarded() {
        let mut graph = CompiledGraph::new("canon", false);
        let spec = TensorSpec::concrete(DType::F32, &[2, 3]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let b = graph.push_node(broadcast(&[2, 3]), vec![x], spec.clone());
        let r = graph.push_node(
            Operation::Reshape(ReshapeSpec {
                new_shape: vec![ReshapeDim::Explicit(2), ReshapeDim::Infer],
            }),
            vec![b],
            spec.clone(),
        );
        let sum = graph.push_node(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![r, x],
            spec,
        );
        graph.outputs.push(sum);

        let stats = BroadcastCanonicalizationPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(stats.changed);
        assert_eq!(stats.erased_nodes, 2);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].operands, vec![x, x]);
    }

    #[test]
    fn broadcast_chains_read_the_base_operand() {
        let mut graph = CompiledGraph::new("canon", false);
        let x = graph.add_input(TensorSpec::concrete(DType::F32, &[3]), InputRole::Arg(0));
        let inner = graph.push_node(
            broadcast(&[1, 3]),
            vec![x],
            TensorSpec::concrete(DType::F32, &[1, 3]),
        );
        let outer = graph.push_node(
            broadcast(&[4, 3]),
            vec![inner],
            TensorSpec::concrete(DType::F32, &[4, 3]),
        );
        graph.outputs.push(outer);

        BroadcastCanonicalizationPass.run(&mut graph, &OptimizeContext::new(false));
        let outer_node = graph.nodes.iter().find(|n| n.id == outer).expect("outer kept");
        assert_eq!(outer_node.operands, vec![x]);
    }

    #[test]
    fn shapeless_graphs_keep_shape_dependent_nodes() {
        let mut graph = CompiledGraph::new("canon", true);
        let spec = TensorSpec::concrete(DType::F32, &[2, 3]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let y = graph.add_input(spec.clone(), InputRole::Arg(1));
        let b = graph.push_node(Operation::BroadcastLike, vec![x, y], spec);
        graph.outputs.push(b);

        let stats = BroadcastCanonicalizationPass.run(&mut graph, &OptimizeContext::new(true));
        assert!(!stats.changed);
        assert_eq!(graph.nodes.len(), 1);
    }
}
