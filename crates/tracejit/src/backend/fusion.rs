//! Compound elementwise/broadcast units produced by the fusion pass.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::spec::{
    BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Operation,
};

/// Distinguishes arithmetic fusion from units that only broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionKind {
    Elementwise,
    BroadcastOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionRef {
    Input(usize),
    Node(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusedOp {
    Unary(ElementwiseUnaryOp),
    Binary(ElementwiseBinaryOp),
    Compare(ComparisonOp),
    Select,
    Cast(DType),
    BroadcastTo(Vec<usize>),
    BroadcastLike,
}

impl FusedOp {
    pub fn from_operation(op: &Operation) -> Option<Self> {
        Some(match op {
            Operation::ElementwiseUnary(op) => FusedOp::Unary(*op),
            Operation::ElementwiseBinary(op) => FusedOp::Binary(*op),
            Operation::Compare(spec) => FusedOp::Compare(spec.op),
            Operation::Select => FusedOp::Select,
            Operation::Cast(spec) => FusedOp::Cast(spec.dtype),
            Operation::BroadcastTo(spec) => FusedOp::BroadcastTo(spec.result_shape.clone()),
            Operation::BroadcastLike => FusedOp::BroadcastLike,
            _ => return None,
        })
    }

    pub fn to_operation(&self) -> Operation {
        match self {
            FusedOp::Unary(op) => Operation::ElementwiseUnary(*op),
            FusedOp::Binary(op) => Operation::ElementwiseBinary(*op),
            FusedOp::Compare(op) => Operation::Compare(CompareSpec { op: *op }),
            FusedOp::Select => Operation::Select,
            FusedOp::Cast(dtype) => Operation::Cast(CastSpec { dtype: *dtype }),
            FusedOp::BroadcastTo(dims) => Operation::BroadcastTo(BroadcastToSpec {
                result_shape: dims.clone(),
            }),
            FusedOp::BroadcastLike => Operation::BroadcastLike,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, FusedOp::BroadcastTo(_) | FusedOp::BroadcastLike)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusedNode {
    pub op: FusedOp,
    pub args: SmallVec<[FusionRef; 3]>,
}

/// A fused DAG over the node's operands. Nodes are in topological order and
/// the last node produces the fused result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusedSpec {
    pub label: String,
    pub kind: FusionKind,
    pub nodes: Vec<FusedNode>,
}

impl FusedSpec {
    pub fn new(nodes: Vec<FusedNode>) -> Self {
        let kind = if nodes.iter().all(|node| node.op.is_broadcast()) {
            FusionKind::BroadcastOnly
        } else {
            FusionKind::Elementwise
        };
        let mut label = String::from("Compiled");
        for node in &nodes {
            label.push_str(&node.op.to_operation().label());
        }
        Self { label, kind, nodes }
    }

    pub fn output(&self) -> FusionRef {
        FusionRef::Node(self.nodes.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn label_concatenates_sub_op_names() {
        let spec = FusedSpec::new(vec![
            FusedNode {
                op: FusedOp::BroadcastTo(vec![10, 10]),
                args: smallvec![FusionRef::Input(0)],
            },
            FusedNode {
                op: FusedOp::Binary(ElementwiseBinaryOp::Mul),
                args: smallvec![FusionRef::Node(0), FusionRef::Input(1)],
            },
            FusedNode {
                op: FusedOp::Binary(ElementwiseBinaryOp::Add),
                args: smallvec![FusionRef::Input(2), FusionRef::Node(1)],
            },
        ]);
        assert_eq!(spec.label, "CompiledBroadcastMultiplyAdd");
        assert_eq!(spec.kind, FusionKind::Elementwise);
        assert_eq!(spec.output(), FusionRef::Node(2));
    }

    #[test]
    fn broadcast_chains_form_their_own_kind() {
        let spec = FusedSpec::new(vec![
            FusedNode {
                op: FusedOp::BroadcastTo(vec![1, 3]),
                args: smallvec![FusionRef::Input(0)],
            },
            FusedNode {
                op: FusedOp::BroadcastLike,
                args: smallvec![FusionRef::Node(0), FusionRef::Input(1)],
            },
        ]);
        assert_eq!(spec.kind, FusionKind::BroadcastOnly);
        assert_eq!(spec.label, "CompiledBroadcastBroadcast");
    }
}
