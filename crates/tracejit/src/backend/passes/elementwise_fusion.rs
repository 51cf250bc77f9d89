use std::collections::{BTreeSet, HashMap, HashSet};

use smallvec::SmallVec;

use crate::backend::fusion::{FusedNode, FusedOp, FusedSpec, FusionRef};
use crate::backend::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::backend::spec::{Operation, ValueId};
use crate::compile::CompiledGraph;

/// Merges chains of elementwise and broadcast nodes into single `Fused` nodes.
///
/// A group grows from its last node toward its producers. A producer joins
/// when every use of it lies inside the group and it is not a graph output.
/// Broadcast producers with outside uses are duplicated into the group
/// instead, and the original stays for the other consumers. Values read by an
/// already formed group are never absorbed by a later one.
#[derive(Default)]
pub struct ElementwiseFusionPass;

impl ElementwiseFusionPass {
    const NAME: &'static str = "elementwise-fusion";
}

struct Group {
    root: usize,
    /// Node indices, ascending (topological).
    members: BTreeSet<usize>,
    /// Members that stay in the graph for outside consumers.
    duplicated: HashSet<usize>,
}

impl Group {
    fn external_inputs(&self, graph: &CompiledGraph, extra: Option<usize>) -> Vec<ValueId> {
        let ids: HashSet<ValueId> = self
            .members
            .iter()
            .chain(extra.iter())
            .map(|&idx| graph.nodes[idx].id)
            .collect();
        let mut inputs = Vec::new();
        for &idx in self.members.iter().chain(extra.iter()) {
            for operand in &graph.nodes[idx].operands {
                if !ids.contains(operand) && !inputs.contains(operand) {
                    inputs.push(*operand);
                }
            }
        }
        inputs
    }

    fn internal_uses(&self, graph: &CompiledGraph, value: ValueId) -> usize {
        self.members
            .iter()
            .map(|&idx| {
                graph.nodes[idx]
                    .operands
                    .iter()
                    .filter(|operand| **operand == value)
                    .count()
            })
            .sum()
    }
}

/// Nodes and values already committed to earlier groups.
#[derive(Default)]
struct Claimed {
    /// Members erased into a group.
    absorbed: HashSet<usize>,
    /// Inputs of formed groups, including operands of duplicated broadcasts
    /// that the original graph only read once.
    pinned: HashSet<ValueId>,
}

fn fusible(op: &Operation) -> bool {
    FusedOp::from_operation(op).is_some()
}

fn grow_group(
    graph: &CompiledGraph,
    root: usize,
    def_map: &HashMap<ValueId, usize>,
    uses: &HashMap<ValueId, usize>,
    outputs: &HashSet<ValueId>,
    claimed: &Claimed,
    cx: &OptimizeContext,
) -> Group {
    let mut group = Group {
        root,
        members: BTreeSet::from([root]),
        duplicated: HashSet::new(),
    };
    loop {
        let mut grew = false;
        let frontier: Vec<usize> = group
            .members
            .iter()
            .copied()
            .filter(|idx| !group.duplicated.contains(idx))
            .collect();
        for member in frontier {
            for operand in graph.nodes[member].operands.clone() {
                let Some(&producer) = def_map.get(&operand) else {
                    continue;
                };
                if group.members.contains(&producer)
                    || claimed.absorbed.contains(&producer)
                    || !fusible(&graph.nodes[producer].op)
                {
                    continue;
                }
                let exclusive = !outputs.contains(&operand)
                    && !claimed.pinned.contains(&operand)
                    && uses.get(&operand).copied().unwrap_or(0)
                        == group.internal_uses(graph, operand);
                let duplicate = !exclusive && graph.nodes[producer].op.is_broadcast();
                if !exclusive && !duplicate {
                    continue;
                }
                if group.external_inputs(graph, Some(producer)).len() > cx.max_fused_inputs() {
                    continue;
                }
                group.members.insert(producer);
                if duplicate {
                    group.duplicated.insert(producer);
                }
                grew = true;
            }
        }
        if !grew {
            return group;
        }
    }
}

fn build_spec(graph: &CompiledGraph, group: &Group) -> (FusedSpec, Vec<ValueId>) {
    let inputs = group.external_inputs(graph, None);
    let positions: HashMap<ValueId, usize> = group
        .members
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (graph.nodes[idx].id, pos))
        .collect();
    let nodes = group
        .members
        .iter()
        .filter_map(|&idx| {
            let node = &graph.nodes[idx];
            let op = FusedOp::from_operation(&node.op)?;
            let args: SmallVec<[FusionRef; 3]> = node
                .operands
                .iter()
                .map(|operand| match positions.get(operand) {
                    Some(&pos) => FusionRef::Node(pos),
                    None => FusionRef::Input(
                        inputs
                            .iter()
                            .position(|input| input == operand)
                            .unwrap_or_default(),
                    ),
                })
                .collect();
            Some(FusedNode { op, args })
        })
        .collect();
    (FusedSpec::new(nodes), inputs)
}

impl FunctionPass for ElementwiseFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut CompiledGraph, cx: &OptimizeContext) -> PassResult {
        let uses = graph.use_counts();
        let outputs: HashSet<ValueId> = graph.outputs.iter().copied().collect();
        let def_map: HashMap<ValueId, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id, idx))
            .collect();

        let mut claimed = Claimed::default();
        let mut groups: Vec<Group> = Vec::new();
        for root in (0..graph.nodes.len()).rev() {
            if claimed.absorbed.contains(&root) || !fusible(&graph.nodes[root].op) {
                continue;
            }
            let group = grow_group(graph, root, &def_map, &uses, &outputs, &claimed, cx);
            if group.members.len() < 2 {
                continue;
            }
            for &idx in &group.members {
                if idx != root && !group.duplicated.contains(&idx) {
                    claimed.absorbed.insert(idx);
                }
            }
            claimed.absorbed.insert(root);
            claimed.pinned.extend(group.external_inputs(graph, None));
            groups.push(group);
        }

        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        if groups.is_empty() {
            return stats;
        }

        let mut replacements: HashMap<usize, (Operation, Vec<ValueId>)> = HashMap::new();
        let mut erased: HashSet<usize> = HashSet::new();
        for group in &groups {
            let (spec, inputs) = build_spec(graph, group);
            log::trace!("{}: fused {} nodes into {}", graph.name, group.members.len(), spec.label);
            replacements.insert(group.root, (Operation::Fused(spec), inputs));
            erased.extend(
                group
                    .members
                    .iter()
                    .copied()
                    .filter(|idx| *idx != group.root && !group.duplicated.contains(idx)),
            );
        }

        let nodes = std::mem::take(&mut graph.nodes);
        graph.nodes = nodes
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !erased.contains(idx))
            .map(|(idx, mut node)| {
                if let Some((op, operands)) = replacements.remove(&idx) {
                    node.op = op;
                    node.operands = operands;
                }
                node
            })
            .collect();

        stats.changed = true;
        stats.rewrites_applied = groups.len();
        stats.erased_nodes = erased.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fusion::FusionKind;
    use crate::backend::spec::{
        BroadcastToSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, ReduceKind, ReduceSpec,
        TensorSpec,
    };
    use crate::compile::graph::InputRole;

    fn binary(op: ElementwiseBinaryOp) -> Operation {
        Operation::ElementwiseBinary(op)
    }

    #[test]
    fn shared_broadcast_is_duplicated_into_the_group() {
        let mut graph = CompiledGraph::new("fuse", false);
        let mat = TensorSpec::concrete(DType::F32, &[10, 10]);
        let a = graph.add_input(mat.clone(), InputRole::Arg(0));
        let b = graph.add_input(TensorSpec::concrete(DType::F32, &[]), InputRole::Arg(1));
        let c = graph.add_input(mat.clone(), InputRole::Arg(2));
        let yy = graph.push_node(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: vec![10, 10],
            }),
            vec![b],
            mat.clone(),
        );
        let prod = graph.push_node(binary(ElementwiseBinaryOp::Mul), vec![yy, c], mat.clone());
        let sum = graph.push_node(binary(ElementwiseBinaryOp::Add), vec![a, prod], mat);
        let total = graph.push_node(
            Operation::Reduce(ReduceSpec {
                kind: ReduceKind::Sum,
                axes: vec![0, 1],
                keepdims: false,
            }),
            vec![yy],
            TensorSpec::concrete(DType::F32, &[]),
        );
        graph.outputs.extend([sum, total]);

        let stats = ElementwiseFusionPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(stats.changed);
        assert_eq!(stats.erased_nodes, 1);
        assert_eq!(graph.count_label("CompiledBroadcastMultiplyAdd"), 1);
        assert_eq!(graph.count_label("Broadcast"), 1);
        let fused = graph.nodes.iter().find(|n| n.id == sum).expect("root kept");
        assert_eq!(fused.operands, vec![b, c, a]);
    }

    #[test]
    fn inputs_of_a_duplicated_broadcast_survive_later_groups() {
        let mut graph = CompiledGraph::new("fuse", false);
        let mat = TensorSpec::concrete(DType::F32, &[3, 3]);
        let row = TensorSpec::concrete(DType::F32, &[3]);
        let x = graph.add_input(mat.clone(), InputRole::Arg(0));
        let b = graph.add_input(row.clone(), InputRole::Arg(1));
        let z = graph.add_input(mat.clone(), InputRole::Arg(2));
        let e = graph.push_node(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
            vec![b],
            row,
        );
        let bc = graph.push_node(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: vec![3, 3],
            }),
            vec![e],
            mat.clone(),
        );
        let prod = graph.push_node(binary(ElementwiseBinaryOp::Mul), vec![bc, z], mat.clone());
        let sum = graph.push_node(binary(ElementwiseBinaryOp::Add), vec![x, prod], mat);
        let total = graph.push_node(
            Operation::Reduce(ReduceSpec {
                kind: ReduceKind::Sum,
                axes: vec![0, 1],
                keepdims: false,
            }),
            vec![bc],
            TensorSpec::concrete(DType::F32, &[]),
        );
        graph.outputs.extend([sum, total]);

        ElementwiseFusionPass.run(&mut graph, &OptimizeContext::new(false));

        let mut defined: HashSet<ValueId> = graph.inputs.iter().map(|input| input.id).collect();
        for node in &graph.nodes {
            for operand in &node.operands {
                assert!(defined.contains(operand), "%{} read before definition", operand.0);
            }
            defined.insert(node.id);
        }
        assert!(graph.nodes.iter().any(|node| node.id == e));
        let fused = graph.nodes.iter().find(|n| n.id == sum).expect("root kept");
        assert!(fused.operands.contains(&e));
    }

    #[test]
    fn graph_outputs_are_never_absorbed() {
        let mut graph = CompiledGraph::new("fuse", false);
        let spec = TensorSpec::concrete(DType::F32, &[3]);
        let x = graph.add_input(spec.clone(), InputRole::Arg(0));
        let e = graph.push_node(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
            vec![x],
            spec.clone(),
        );
        let n = graph.push_node(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg),
            vec![e],
            spec,
        );
        graph.outputs.extend([e, n]);

        let stats = ElementwiseFusionPass.run(&mut graph, &OptimizeContext::new(false));
        assert!(!stats.changed);
        assert_eq!(graph.nodes.len(), 2);
    }

    #[test]
    fn fused_inputs_respect_the_limit() {
        let mut graph = CompiledGraph::new("fuse", false);
        let spec = TensorSpec::concrete(DType::F32, &[3]);
        let inputs: Vec<ValueId> = (0..4)
            .map(|i| graph.add_input(spec.clone(), InputRole::Arg(i)))
            .collect();
        let ab = graph.push_node(
            binary(ElementwiseBinaryOp::Add),
            vec![inputs[0], inputs[1]],
            spec.clone(),
        );
        let abc = graph.push_node(
            binary(ElementwiseBinaryOp::Mul),
            vec![ab, inputs[2]],
            spec.clone(),
        );
        let abcd = graph.push_node(binary(ElementwiseBinaryOp::Sub), vec![abc, inputs[3]], spec);
        graph.outputs.push(abcd);

        let cx = OptimizeContext::new(false).with_max_fused_inputs(3);
        ElementwiseFusionPass.run(&mut graph, &cx);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.count_label("CompiledMultiplySubtract"), 1);
    }

    #[test]
    fn broadcast_only_groups_are_tagged() {
        let mut graph = CompiledGraph::new("fuse", false);
        let x = graph.add_input(TensorSpec::concrete(DType::F32, &[3]), InputRole::Arg(0));
        let y = graph.add_input(TensorSpec::concrete(DType::F32, &[2, 3]), InputRole::Arg(1));
        let row = graph.push_node(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: vec![1, 3],
            }),
            vec![x],
            TensorSpec::concrete(DType::F32, &[1, 3]),
        );
        let full = graph.push_node(
            Operation::BroadcastLike,
            vec![row, y],
            TensorSpec::concrete(DType::F32, &[2, 3]),
        );
        graph.outputs.push(full);

        ElementwiseFusionPass.run(&mut graph, &OptimizeContext::new(false));
        assert_eq!(graph.nodes.len(), 1);
        let Operation::Fused(spec) = &graph.nodes[0].op else {
            panic!("expected a fused node, got {:?}", graph.nodes[0].op);
        };
        assert_eq!(spec.kind, FusionKind::BroadcastOnly);
    }
}
