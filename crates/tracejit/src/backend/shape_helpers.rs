//! Shape inference shared by array construction, tracing and shapeless binding.
//!
//! Every rule works on concrete extents. A shapeless graph keeps the recorded
//! operations and replays [`infer_spec`] against the bound inputs, so these
//! rules are the single source of truth for shape compatibility.

use crate::backend::fusion::{FusedSpec, FusionRef};
use crate::backend::spec::{
    DType, Operation, ReduceKind, ReshapeDim, TensorSpec, UnflattenSpec,
};
use crate::error::CompileError;

/// Returns the dims of `spec`, failing when any dimension is symbolic.
pub fn static_dims(spec: &TensorSpec, op: &str) -> Result<Vec<usize>, CompileError> {
    spec.shape
        .static_dims()
        .ok_or_else(|| CompileError::shape(op, "dynamic dimension reached shape inference"))
}

/// Numpy-style broadcast of two shapes, aligned on trailing axes.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for axis in 0..rank {
        let l = axis
            .checked_sub(rank - lhs.len())
            .map(|i| lhs[i])
            .unwrap_or(1);
        let r = axis
            .checked_sub(rank - rhs.len())
            .map(|i| rhs[i])
            .unwrap_or(1);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

/// `true` when `input` can be broadcast to exactly `target`.
pub fn is_broadcast_compatible(input: &[usize], target: &[usize]) -> bool {
    if input.len() > target.len() {
        return false;
    }
    let offset = target.len() - input.len();
    input
        .iter()
        .enumerate()
        .all(|(axis, &dim)| dim == 1 || dim == target[offset + axis])
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
    let rank = rank as isize;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Resolves a reshape target with at most one inferred entry against `total` elements.
pub fn resolve_reshape(
    op: &str,
    total: usize,
    new_shape: &[ReshapeDim],
) -> Result<Vec<usize>, CompileError> {
    let mut known = 1usize;
    let mut infer_at = None;
    for (idx, dim) in new_shape.iter().enumerate() {
        match dim {
            ReshapeDim::Explicit(value) => known = known.saturating_mul(*value),
            ReshapeDim::Infer => {
                if infer_at.replace(idx).is_some() {
                    return Err(CompileError::shape(op, "at most one dimension may be inferred"));
                }
            }
        }
    }
    let mut dims: Vec<usize> = new_shape
        .iter()
        .map(|dim| match dim {
            ReshapeDim::Explicit(value) => *value,
            ReshapeDim::Infer => 0,
        })
        .collect();
    match infer_at {
        Some(idx) => {
            if known == 0 || total % known != 0 {
                return Err(CompileError::shape(
                    op,
                    format!("cannot reshape {total} elements into {}", describe_reshape(new_shape)),
                ));
            }
            dims[idx] = total / known;
        }
        None => {
            if known != total {
                return Err(CompileError::shape(
                    op,
                    format!("cannot reshape {total} elements into {}", describe_reshape(new_shape)),
                ));
            }
        }
    }
    Ok(dims)
}

fn describe_reshape(new_shape: &[ReshapeDim]) -> String {
    let parts = new_shape
        .iter()
        .map(|dim| match dim {
            ReshapeDim::Explicit(value) => value.to_string(),
            ReshapeDim::Infer => "-1".to_string(),
        })
        .collect::<Vec<_>>();
    format!("({})", parts.join(", "))
}

/// Resolves a `take` index against the bound extent of its axis.
pub fn resolve_index(index: isize, extent: usize) -> Option<usize> {
    normalize_axis(index, extent)
}

fn expect_arity(op: &str, inputs: &[TensorSpec], arity: usize) -> Result<(), CompileError> {
    if inputs.len() != arity {
        return Err(CompileError::shape(
            op,
            format!("expected {arity} operands, got {}", inputs.len()),
        ));
    }
    Ok(())
}

fn expect_same_dtype(op: &str, lhs: DType, rhs: DType) -> Result<(), CompileError> {
    if lhs != rhs {
        return Err(CompileError::shape(
            op,
            format!("operand dtypes differ ({lhs:?} vs {rhs:?})"),
        ));
    }
    Ok(())
}

fn broadcast_all(op: &str, dims: &[Vec<usize>]) -> Result<Vec<usize>, CompileError> {
    let mut out: Vec<usize> = Vec::new();
    for shape in dims {
        out = broadcast_shapes(&out, shape).ok_or_else(|| {
            CompileError::shape(
                op,
                format!("shapes {:?} cannot be broadcast together", dims),
            )
        })?;
    }
    Ok(out)
}

/// Infers the result spec of `op` applied to operands with `inputs` specs.
pub fn infer_spec(op: &Operation, inputs: &[TensorSpec]) -> Result<TensorSpec, CompileError> {
    let label = op.label();
    let name = label.as_ref();
    let dims = inputs
        .iter()
        .map(|spec| static_dims(spec, name))
        .collect::<Result<Vec<_>, _>>()?;

    match op {
        Operation::Constant(literal) => {
            expect_arity(name, inputs, 0)?;
            Ok(literal.spec.clone())
        }
        Operation::FullLike(spec) => {
            expect_arity(name, inputs, 1)?;
            Ok(TensorSpec::concrete(spec.dtype, &dims[0]))
        }
        Operation::ElementwiseUnary(unary) => {
            expect_arity(name, inputs, 1)?;
            let dtype = match unary {
                crate::backend::spec::ElementwiseUnaryOp::IsInf => DType::I1,
                _ => inputs[0].dtype,
            };
            Ok(TensorSpec::concrete(dtype, &dims[0]))
        }
        Operation::ElementwiseBinary(_) => {
            expect_arity(name, inputs, 2)?;
            expect_same_dtype(name, inputs[0].dtype, inputs[1].dtype)?;
            let out = broadcast_all(name, &dims)?;
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Compare(_) => {
            expect_arity(name, inputs, 2)?;
            expect_same_dtype(name, inputs[0].dtype, inputs[1].dtype)?;
            let out = broadcast_all(name, &dims)?;
            Ok(TensorSpec::concrete(DType::I1, &out))
        }
        Operation::Select => {
            expect_arity(name, inputs, 3)?;
            if inputs[0].dtype != DType::I1 {
                return Err(CompileError::shape(name, "condition must be boolean"));
            }
            expect_same_dtype(name, inputs[1].dtype, inputs[2].dtype)?;
            let out = broadcast_all(name, &dims)?;
            Ok(TensorSpec::concrete(inputs[1].dtype, &out))
        }
        Operation::Cast(spec) => {
            expect_arity(name, inputs, 1)?;
            Ok(TensorSpec::concrete(spec.dtype, &dims[0]))
        }
        Operation::Reduce(spec) => {
            expect_arity(name, inputs, 1)?;
            let rank = dims[0].len();
            let mut seen = vec![false; rank];
            for &axis in &spec.axes {
                if axis >= rank || seen[axis] {
                    return Err(CompileError::shape(
                        name,
                        format!("invalid reduction axes {:?} for rank {rank}", spec.axes),
                    ));
                }
                seen[axis] = true;
            }
            let out: Vec<usize> = if spec.keepdims {
                dims[0]
                    .iter()
                    .enumerate()
                    .map(|(axis, &d)| if seen[axis] { 1 } else { d })
                    .collect()
            } else {
                dims[0]
                    .iter()
                    .enumerate()
                    .filter(|(axis, _)| !seen[*axis])
                    .map(|(_, &d)| d)
                    .collect()
            };
            let dtype = match spec.kind {
                ReduceKind::Mean if !inputs[0].dtype.is_float() => {
                    return Err(CompileError::shape(name, "mean requires a float operand"))
                }
                _ => inputs[0].dtype,
            };
            Ok(TensorSpec::concrete(dtype, &out))
        }
        Operation::Reshape(spec) => {
            expect_arity(name, inputs, 1)?;
            let out = resolve_reshape(name, element_count(&dims[0]), &spec.new_shape)?;
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::ReshapeLike => {
            expect_arity(name, inputs, 2)?;
            if element_count(&dims[0]) != element_count(&dims[1]) {
                return Err(CompileError::shape(
                    name,
                    format!("cannot reshape {:?} into {:?}", dims[0], dims[1]),
                ));
            }
            Ok(TensorSpec::concrete(inputs[0].dtype, &dims[1]))
        }
        Operation::Transpose(spec) => {
            expect_arity(name, inputs, 1)?;
            let rank = dims[0].len();
            let mut seen = vec![false; rank];
            if spec.perm.len() != rank {
                return Err(CompileError::shape(
                    name,
                    format!("permutation {:?} does not match rank {rank}", spec.perm),
                ));
            }
            for &axis in &spec.perm {
                if axis >= rank || seen[axis] {
                    return Err(CompileError::shape(
                        name,
                        format!("invalid permutation {:?}", spec.perm),
                    ));
                }
                seen[axis] = true;
            }
            let out: Vec<usize> = spec.perm.iter().map(|&axis| dims[0][axis]).collect();
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::BroadcastTo(spec) => {
            expect_arity(name, inputs, 1)?;
            if !is_broadcast_compatible(&dims[0], &spec.result_shape) {
                return Err(CompileError::shape(
                    name,
                    format!("cannot broadcast {:?} to {:?}", dims[0], spec.result_shape),
                ));
            }
            Ok(TensorSpec::concrete(inputs[0].dtype, &spec.result_shape))
        }
        Operation::BroadcastLike => {
            if inputs.is_empty() {
                return Err(CompileError::shape(name, "expected at least one operand"));
            }
            let out = broadcast_all(name, &dims)?;
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::ReduceToLike => {
            expect_arity(name, inputs, 2)?;
            if !is_broadcast_compatible(&dims[1], &dims[0]) {
                return Err(CompileError::shape(
                    name,
                    format!("cannot sum {:?} down to {:?}", dims[0], dims[1]),
                ));
            }
            Ok(TensorSpec::concrete(inputs[0].dtype, &dims[1]))
        }
        Operation::ExpandDims(spec) => {
            expect_arity(name, inputs, 1)?;
            let out_rank = dims[0].len() + spec.axes.len();
            let mut out = Vec::with_capacity(out_rank);
            let mut source = dims[0].iter();
            for axis in 0..out_rank {
                if spec.axes.contains(&axis) {
                    out.push(1);
                } else {
                    let next = source.next().ok_or_else(|| {
                        CompileError::shape(name, format!("invalid axes {:?}", spec.axes))
                    })?;
                    out.push(*next);
                }
            }
            if source.next().is_some() {
                return Err(CompileError::shape(name, format!("invalid axes {:?}", spec.axes)));
            }
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Squeeze(spec) => {
            expect_arity(name, inputs, 1)?;
            for &axis in &spec.axes {
                if axis >= dims[0].len() || dims[0][axis] != 1 {
                    return Err(CompileError::shape(
                        name,
                        format!("cannot squeeze axis {axis} of {:?}", dims[0]),
                    ));
                }
            }
            let out: Vec<usize> = dims[0]
                .iter()
                .enumerate()
                .filter(|(axis, _)| !spec.axes.contains(axis))
                .map(|(_, &d)| d)
                .collect();
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Unflatten(spec) => {
            expect_arity(name, inputs, 1)?;
            let out = unflatten_dims(name, &dims[0], spec)?;
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Matmul => {
            expect_arity(name, inputs, 2)?;
            expect_same_dtype(name, inputs[0].dtype, inputs[1].dtype)?;
            let (a, b) = (&dims[0], &dims[1]);
            if a.len() < 2 || b.len() < 2 {
                return Err(CompileError::shape(name, "operands must have rank >= 2"));
            }
            let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
            let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
            if k != k2 {
                return Err(CompileError::shape(
                    name,
                    format!("contraction mismatch between {a:?} and {b:?}"),
                ));
            }
            let mut out = broadcast_shapes(&a[..a.len() - 2], &b[..b.len() - 2]).ok_or_else(|| {
                CompileError::shape(
                    name,
                    format!("batch dims of {a:?} and {b:?} cannot be broadcast"),
                )
            })?;
            out.push(m);
            out.push(n);
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Take(spec) => {
            expect_arity(name, inputs, 1)?;
            let source = &dims[0];
            if spec.axis >= source.len() {
                return Err(CompileError::shape(
                    name,
                    format!("axis {} out of range for rank {}", spec.axis, source.len()),
                ));
            }
            if resolve_index(spec.index, source[spec.axis]).is_none() {
                return Err(CompileError::shape(
                    name,
                    format!("index {} out of range for extent {}", spec.index, source[spec.axis]),
                ));
            }
            let mut out = source.clone();
            out.remove(spec.axis);
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::ScatterSlice(spec) => {
            expect_arity(name, inputs, 2)?;
            let target = &dims[1];
            if spec.axis >= target.len() || resolve_index(spec.index, target[spec.axis]).is_none() {
                return Err(CompileError::shape(
                    name,
                    format!("index {} on axis {} invalid for {target:?}", spec.index, spec.axis),
                ));
            }
            let mut expected = target.clone();
            expected.remove(spec.axis);
            if expected != dims[0] {
                return Err(CompileError::shape(
                    name,
                    format!("slice {:?} does not fit {target:?}", dims[0]),
                ));
            }
            Ok(TensorSpec::concrete(inputs[0].dtype, target))
        }
        Operation::Stack(spec) => {
            let first = dims
                .first()
                .ok_or_else(|| CompileError::shape(name, "expected at least one operand"))?;
            for (spec_in, d) in inputs.iter().zip(dims.iter()) {
                expect_same_dtype(name, inputs[0].dtype, spec_in.dtype)?;
                if d != first {
                    return Err(CompileError::shape(
                        name,
                        format!("operands must share a shape ({first:?} vs {d:?})"),
                    ));
                }
            }
            if spec.axis > first.len() {
                return Err(CompileError::shape(name, "stack axis out of range"));
            }
            let mut out = first.clone();
            out.insert(spec.axis, dims.len());
            Ok(TensorSpec::concrete(inputs[0].dtype, &out))
        }
        Operation::Fused(spec) => infer_fused(spec, inputs),
    }
}

fn unflatten_dims(
    op: &str,
    source: &[usize],
    spec: &UnflattenSpec,
) -> Result<Vec<usize>, CompileError> {
    if spec.axis >= source.len() {
        return Err(CompileError::shape(
            op,
            format!("axis {} out of range for rank {}", spec.axis, source.len()),
        ));
    }
    let split = resolve_reshape(op, source[spec.axis], &spec.sizes)?;
    let mut out = Vec::with_capacity(source.len() + split.len() - 1);
    out.extend_from_slice(&source[..spec.axis]);
    out.extend_from_slice(&split);
    out.extend_from_slice(&source[spec.axis + 1..]);
    Ok(out)
}

/// Replays the sub-operations of a fused unit; returns the spec of its last node.
pub fn infer_fused(spec: &FusedSpec, inputs: &[TensorSpec]) -> Result<TensorSpec, CompileError> {
    let mut node_specs: Vec<TensorSpec> = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        let mut args = Vec::with_capacity(node.args.len());
        for arg in &node.args {
            let arg_spec = match *arg {
                FusionRef::Input(idx) => inputs.get(idx),
                FusionRef::Node(idx) => node_specs.get(idx),
            }
            .ok_or_else(|| CompileError::shape(&spec.label, "dangling fused reference"))?;
            args.push(arg_spec.clone());
        }
        node_specs.push(infer_spec(&node.op.to_operation(), &args)?);
    }
    node_specs
        .pop()
        .ok_or_else(|| CompileError::shape(&spec.label, "fused unit has no nodes"))
}

/// Row-major contiguous strides.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut acc = 1usize;
    for (axis, dim) in dims.iter().enumerate().rev() {
        strides[axis] = acc;
        acc *= *dim;
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        BroadcastToSpec, ElementwiseBinaryOp, ReduceSpec, ReshapeSpec, TakeSpec,
    };

    fn f32_spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::concrete(DType::F32, dims)
    }

    #[test]
    fn broadcast_aligns_trailing_axes() {
        assert_eq!(broadcast_shapes(&[2, 1, 4], &[3, 1]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shapes(&[], &[5]), Some(vec![5]));
        assert_eq!(broadcast_shapes(&[2], &[3]), None);
    }

    #[test]
    fn reshape_with_inferred_dim_rejects_uneven_totals() {
        let spec = ReshapeSpec {
            new_shape: vec![ReshapeDim::Explicit(6), ReshapeDim::Infer],
        };
        let op = Operation::Reshape(spec);
        let ok = infer_spec(&op, &[f32_spec(&[2, 3, 8])]).expect("6 divides 48");
        assert_eq!(ok.shape.static_dims(), Some(vec![6, 8]));
        let err = infer_spec(&op, &[f32_spec(&[5, 5, 5])]).unwrap_err();
        assert!(matches!(err, CompileError::Shape { .. }));
    }

    #[test]
    fn batched_matmul_broadcasts_batch_dims() {
        let out = infer_spec(&Operation::Matmul, &[f32_spec(&[2, 1, 4, 2]), f32_spec(&[3, 2, 5])])
            .expect("compatible batch dims");
        assert_eq!(out.shape.static_dims(), Some(vec![2, 3, 4, 5]));
    }

    #[test]
    fn broadcast_to_rejects_higher_rank_input() {
        let op = Operation::BroadcastTo(BroadcastToSpec {
            result_shape: vec![2, 2],
        });
        assert!(infer_spec(&op, &[f32_spec(&[])]).is_ok());
        assert!(infer_spec(&op, &[f32_spec(&[1, 1, 1])]).is_err());
    }

    #[test]
    fn reduction_drops_or_keeps_axes() {
        let keep = Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            axes: vec![1],
            keepdims: true,
        });
        let drop = Operation::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            axes: vec![1],
            keepdims: false,
        });
        let input = f32_spec(&[3, 2]);
        assert_eq!(
            infer_spec(&keep, &[input.clone()]).unwrap().shape.static_dims(),
            Some(vec![3, 1])
        );
        assert_eq!(
            infer_spec(&drop, &[input]).unwrap().shape.static_dims(),
            Some(vec![3])
        );
    }

    #[test]
    fn take_resolves_negative_index_per_extent() {
        let op = Operation::Take(TakeSpec { axis: 1, index: -1 });
        let out = infer_spec(&op, &[f32_spec(&[1, 4, 32])]).unwrap();
        assert_eq!(out.shape.static_dims(), Some(vec![1, 32]));
        assert!(infer_spec(&op, &[f32_spec(&[1, 0, 32])]).is_err());
    }

    #[test]
    fn binary_rejects_mixed_dtypes() {
        let op = Operation::ElementwiseBinary(ElementwiseBinaryOp::Add);
        let err = infer_spec(
            &op,
            &[f32_spec(&[2]), TensorSpec::concrete(DType::Si32, &[2])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("dtypes differ"));
    }
}
