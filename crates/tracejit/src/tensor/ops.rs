//! Operation surface of [`Array`]. Every method records a node; nothing runs
//! until an evaluation barrier.

use anyhow::{anyhow, Result};

use crate::backend::shape_helpers::normalize_axis;
use crate::backend::spec::{
    BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp, DType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, ExpandDimsSpec, FullLikeSpec, Operation, ReduceKind, ReduceSpec,
    ReshapeDim, ReshapeSpec, SqueezeSpec, StackSpec, TakeSpec, TransposeSpec, UnflattenSpec,
};
use crate::error::CompileError;
use crate::tensor::array::Array;

fn resolve_axes(op: &str, axes: &[isize], rank: usize) -> Result<Vec<usize>, CompileError> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let resolved = normalize_axis(axis, rank).ok_or_else(|| {
            CompileError::shape(op, format!("axis {axis} out of range for rank {rank}"))
        })?;
        if out.contains(&resolved) {
            return Err(CompileError::shape(op, format!("repeated axis {axis}")));
        }
        out.push(resolved);
    }
    out.sort_unstable();
    Ok(out)
}

fn reshape_dims(sizes: &[isize]) -> Result<Vec<ReshapeDim>, CompileError> {
    sizes
        .iter()
        .map(|&size| match size {
            -1 => Ok(ReshapeDim::Infer),
            s if s >= 0 => Ok(ReshapeDim::Explicit(s as usize)),
            s => Err(CompileError::invalid(format!("invalid dimension {s}"))),
        })
        .collect()
}

fn float_dtype(dtype: DType) -> DType {
    if dtype.is_float() {
        dtype
    } else {
        DType::F32
    }
}

impl Array {
    /// Weakly typed scalar matching `like`: it adopts the array's dtype unless
    /// the value cannot be represented there.
    pub fn scalar_like(value: f64, like: &Array) -> Result<Array> {
        let dtype = match like.dtype() {
            DType::F32 => DType::F32,
            _ if value.fract() != 0.0 || !value.is_finite() => DType::F32,
            DType::Si32 | DType::I1 => DType::Si32,
        };
        Array::full(&[], value, dtype)
    }

    pub fn astype(&self, dtype: DType) -> Result<Array> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        Array::from_node(Operation::Cast(CastSpec { dtype }), vec![self.clone()])
    }

    fn promoted(&self, other: &Array) -> Result<(Array, Array)> {
        let dtype = self.dtype().promote(other.dtype());
        Ok((self.astype(dtype)?, other.astype(dtype)?))
    }

    fn binary(&self, other: &Array, op: ElementwiseBinaryOp) -> Result<Array> {
        let (lhs, rhs) = self.promoted(other)?;
        Array::from_node(Operation::ElementwiseBinary(op), vec![lhs, rhs])
    }

    fn unary(&self, op: ElementwiseUnaryOp) -> Result<Array> {
        Array::from_node(Operation::ElementwiseUnary(op), vec![self.clone()])
    }

    fn float_unary(&self, op: ElementwiseUnaryOp) -> Result<Array> {
        self.astype(float_dtype(self.dtype()))?.unary(op)
    }

    pub fn add(&self, other: &Array) -> Result<Array> {
        self.binary(other, ElementwiseBinaryOp::Add)
    }

    pub fn sub(&self, other: &Array) -> Result<Array> {
        self.binary(other, ElementwiseBinaryOp::Sub)
    }

    pub fn mul(&self, other: &Array) -> Result<Array> {
        self.binary(other, ElementwiseBinaryOp::Mul)
    }

    /// True division; integer operands are promoted to float.
    pub fn div(&self, other: &Array) -> Result<Array> {
        let dtype = float_dtype(self.dtype().promote(other.dtype()));
        self.astype(dtype)?
            .binary(&other.astype(dtype)?, ElementwiseBinaryOp::Div)
    }

    pub fn maximum(&self, other: &Array) -> Result<Array> {
        self.binary(other, ElementwiseBinaryOp::Maximum)
    }

    pub fn minimum(&self, other: &Array) -> Result<Array> {
        self.binary(other, ElementwiseBinaryOp::Minimum)
    }

    pub fn pow(&self, exponent: &Array) -> Result<Array> {
        self.binary(exponent, ElementwiseBinaryOp::Pow)
    }

    pub fn add_scalar(&self, value: f64) -> Result<Array> {
        self.add(&Array::scalar_like(value, self)?)
    }

    pub fn sub_scalar(&self, value: f64) -> Result<Array> {
        self.sub(&Array::scalar_like(value, self)?)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Array> {
        self.mul(&Array::scalar_like(value, self)?)
    }

    pub fn div_scalar(&self, value: f64) -> Result<Array> {
        self.div(&Array::scalar_like(value, self)?)
    }

    pub fn pow_scalar(&self, value: f64) -> Result<Array> {
        self.pow(&Array::scalar_like(value, self)?)
    }

    pub fn neg(&self) -> Result<Array> {
        self.unary(ElementwiseUnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Array> {
        self.unary(ElementwiseUnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Log)
    }

    pub fn sin(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Cos)
    }

    pub fn sqrt(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Sqrt)
    }

    pub fn tanh(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::Tanh)
    }

    pub fn isinf(&self) -> Result<Array> {
        self.float_unary(ElementwiseUnaryOp::IsInf)
    }

    fn compare(&self, other: &Array, op: ComparisonOp) -> Result<Array> {
        let (lhs, rhs) = self.promoted(other)?;
        Array::from_node(Operation::Compare(CompareSpec { op }), vec![lhs, rhs])
    }

    pub fn equal(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::Equal)
    }

    pub fn not_equal(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::NotEqual)
    }

    pub fn less(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::Less)
    }

    pub fn less_equal(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::LessEqual)
    }

    pub fn greater(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::Greater)
    }

    pub fn greater_equal(&self, other: &Array) -> Result<Array> {
        self.compare(other, ComparisonOp::GreaterEqual)
    }

    /// `where(condition, on_true, on_false)` with broadcasting.
    pub fn select(condition: &Array, on_true: &Array, on_false: &Array) -> Result<Array> {
        let condition = condition.astype(DType::I1)?;
        let (on_true, on_false) = on_true.promoted(on_false)?;
        Array::from_node(Operation::Select, vec![condition, on_true, on_false])
    }

    fn reduce(&self, kind: ReduceKind, axes: &[isize], keepdims: bool) -> Result<Array> {
        let label = Operation::Reduce(ReduceSpec {
            kind,
            axes: Vec::new(),
            keepdims,
        })
        .label()
        .into_owned();
        let axes = if axes.is_empty() {
            (0..self.ndim()).collect()
        } else {
            resolve_axes(&label, axes, self.ndim())?
        };
        let source = match kind {
            ReduceKind::Mean => self.astype(float_dtype(self.dtype()))?,
            ReduceKind::Sum if self.dtype() == DType::I1 => self.astype(DType::Si32)?,
            _ => self.clone(),
        };
        Array::from_node(
            Operation::Reduce(ReduceSpec {
                kind,
                axes,
                keepdims,
            }),
            vec![source],
        )
    }

    /// Sums over `axes`; an empty slice reduces every axis.
    pub fn sum(&self, axes: &[isize], keepdims: bool) -> Result<Array> {
        self.reduce(ReduceKind::Sum, axes, keepdims)
    }

    pub fn mean(&self, axes: &[isize], keepdims: bool) -> Result<Array> {
        self.reduce(ReduceKind::Mean, axes, keepdims)
    }

    pub fn max(&self, axes: &[isize], keepdims: bool) -> Result<Array> {
        self.reduce(ReduceKind::Max, axes, keepdims)
    }

    pub fn min(&self, axes: &[isize], keepdims: bool) -> Result<Array> {
        self.reduce(ReduceKind::Min, axes, keepdims)
    }

    /// Reshapes to `shape`; a single `-1` entry is inferred.
    pub fn reshape(&self, shape: &[isize]) -> Result<Array> {
        let new_shape = reshape_dims(shape)?;
        Array::from_node(Operation::Reshape(ReshapeSpec { new_shape }), vec![self.clone()])
    }

    pub fn flatten(&self) -> Result<Array> {
        self.reshape(&[-1])
    }

    pub fn transpose(&self, perm: &[usize]) -> Result<Array> {
        Array::from_node(
            Operation::Transpose(TransposeSpec {
                perm: perm.to_vec(),
            }),
            vec![self.clone()],
        )
    }

    /// Reverses all axes.
    pub fn t(&self) -> Result<Array> {
        let perm: Vec<usize> = (0..self.ndim()).rev().collect();
        self.transpose(&perm)
    }

    /// Swaps the last two axes.
    pub fn matrix_transpose(&self) -> Result<Array> {
        let rank = self.ndim();
        if rank < 2 {
            return Ok(self.clone());
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(rank - 2, rank - 1);
        self.transpose(&perm)
    }

    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Array> {
        Array::from_node(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape.to_vec(),
            }),
            vec![self.clone()],
        )
    }

    /// Broadcasts `self` against the shape of `other`.
    pub fn broadcast_like(&self, other: &Array) -> Result<Array> {
        Array::from_node(Operation::BroadcastLike, vec![self.clone(), other.clone()])
    }

    /// Sums broadcast axes away until the result has the shape of `target`.
    pub fn sum_to_like(&self, target: &Array) -> Result<Array> {
        if self.shape() == target.shape() {
            return Ok(self.clone());
        }
        Array::from_node(Operation::ReduceToLike, vec![self.clone(), target.clone()])
    }

    pub fn reshape_like(&self, target: &Array) -> Result<Array> {
        Array::from_node(Operation::ReshapeLike, vec![self.clone(), target.clone()])
    }

    pub fn expand_dims(&self, axes: &[isize]) -> Result<Array> {
        let out_rank = self.ndim() + axes.len();
        let axes = resolve_axes("ExpandDims", axes, out_rank)?;
        Array::from_node(Operation::ExpandDims(ExpandDimsSpec { axes }), vec![self.clone()])
    }

    pub fn squeeze(&self, axes: &[isize]) -> Result<Array> {
        let axes = if axes.is_empty() {
            self.shape()
                .iter()
                .enumerate()
                .filter(|(_, &d)| d == 1)
                .map(|(axis, _)| axis)
                .collect()
        } else {
            resolve_axes("Squeeze", axes, self.ndim())?
        };
        Array::from_node(Operation::Squeeze(SqueezeSpec { axes }), vec![self.clone()])
    }

    /// Splits `axis` into `sizes`; one entry may be `-1`.
    pub fn unflatten(&self, axis: isize, sizes: &[isize]) -> Result<Array> {
        let axis = normalize_axis(axis, self.ndim()).ok_or_else(|| {
            CompileError::shape("Unflatten", format!("axis {axis} out of range"))
        })?;
        let sizes = reshape_dims(sizes)?;
        Array::from_node(Operation::Unflatten(UnflattenSpec { axis, sizes }), vec![self.clone()])
    }

    /// Matrix product with numpy semantics: 1-D operands are promoted to
    /// matrices and the inserted axis is removed from the result.
    pub fn matmul(&self, other: &Array) -> Result<Array> {
        if self.ndim() == 0 || other.ndim() == 0 {
            return Err(CompileError::shape("Matmul", "operands must have rank >= 1").into());
        }
        let (lhs, rhs) = self.promoted(other)?;
        let lhs_vector = lhs.ndim() == 1;
        let rhs_vector = rhs.ndim() == 1;
        let lhs = if lhs_vector { lhs.expand_dims(&[0])? } else { lhs };
        let rhs = if rhs_vector { rhs.expand_dims(&[-1])? } else { rhs };
        let out = Array::from_node(Operation::Matmul, vec![lhs, rhs])?;
        match (lhs_vector, rhs_vector) {
            (true, true) => out.squeeze(&[-2, -1]),
            (true, false) => out.squeeze(&[-2]),
            (false, true) => out.squeeze(&[-1]),
            (false, false) => Ok(out),
        }
    }

    /// Selects `index` along `axis` and drops the axis (`x[:, -1, :]`).
    pub fn take(&self, axis: isize, index: isize) -> Result<Array> {
        let axis = normalize_axis(axis, self.ndim())
            .ok_or_else(|| CompileError::shape("Take", format!("axis {axis} out of range")))?;
        Array::from_node(Operation::Take(TakeSpec { axis, index }), vec![self.clone()])
    }

    /// Joins same-shaped arrays along a new axis.
    pub fn stack(arrays: &[Array], axis: isize) -> Result<Array> {
        let first = arrays
            .first()
            .ok_or_else(|| anyhow!("stack requires at least one array"))?;
        let axis = normalize_axis(axis, first.ndim() + 1)
            .ok_or_else(|| CompileError::shape("Stack", format!("axis {axis} out of range")))?;
        let dtype = arrays
            .iter()
            .fold(first.dtype(), |acc, array| acc.promote(array.dtype()));
        let operands = arrays
            .iter()
            .map(|array| array.astype(dtype))
            .collect::<Result<Vec<_>>>()?;
        Array::from_node(Operation::Stack(StackSpec { axis }), operands)
    }

    /// Broadcasts every array to their common shape.
    pub fn broadcast_arrays(arrays: &[Array]) -> Result<Vec<Array>> {
        arrays
            .iter()
            .enumerate()
            .map(|(idx, array)| {
                let mut operands = Vec::with_capacity(arrays.len());
                operands.push(array.clone());
                operands.extend(
                    arrays
                        .iter()
                        .enumerate()
                        .filter(|(other, _)| *other != idx)
                        .map(|(_, a)| a.clone()),
                );
                Array::from_node(Operation::BroadcastLike, operands)
            })
            .collect()
    }

    pub fn full_like(&self, value: f64, dtype: DType) -> Result<Array> {
        Array::from_node(
            Operation::FullLike(FullLikeSpec { value, dtype }),
            vec![self.clone()],
        )
    }

    pub fn zeros_like(&self) -> Result<Array> {
        self.full_like(0.0, self.dtype())
    }

    pub fn ones_like(&self) -> Result<Array> {
        self.full_like(1.0, self.dtype())
    }
}
