//! Lazy array handles that delay backend execution until an evaluation barrier.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use once_cell::sync::OnceCell;

use crate::backend::shape_helpers::infer_spec;
use crate::backend::spec::{DType, Operation, TensorLiteral, TensorSpec};

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an array handle. Clones share the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(u64);

impl ArrayId {
    fn next() -> Self {
        ArrayId(NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Identity of one trace; placeholders carry the trace that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub(crate) u64);

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

impl TraceId {
    pub(crate) fn next() -> Self {
        TraceId(NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum Source {
    /// Host data supplied at construction.
    Data,
    /// Graph-local stand-in created by a trace.
    Placeholder { trace: TraceId, index: usize },
    /// Deferred operation over other arrays.
    Node { op: Operation, inputs: Vec<Array> },
}

pub(crate) struct ArrayInner {
    id: ArrayId,
    spec: TensorSpec,
    dims: Vec<usize>,
    source: Source,
    data: OnceCell<TensorLiteral>,
}

/// Immutable, cheaply clonable handle to a lazily evaluated array.
///
/// Node arrays keep their `(op, inputs)` after evaluation so transforms can
/// still walk through values that were already materialized.
#[derive(Clone)]
pub struct Array(Arc<ArrayInner>);

impl Array {
    fn build(spec: TensorSpec, source: Source, data: OnceCell<TensorLiteral>) -> Self {
        let dims = spec.shape.static_dims().unwrap_or_default();
        Array(Arc::new(ArrayInner {
            id: ArrayId::next(),
            spec,
            dims,
            source,
            data,
        }))
    }

    pub fn from_literal(literal: TensorLiteral) -> Result<Self> {
        ensure!(
            literal.spec.shape.static_dims().is_some(),
            "array data must have static dims"
        );
        let spec = literal.spec.clone();
        Ok(Self::build(spec, Source::Data, OnceCell::with_value(literal)))
    }

    pub fn from_f32(values: &[f32], dims: &[usize]) -> Result<Self> {
        Self::from_literal(TensorLiteral::from_f32(dims, values)?)
    }

    pub fn from_i32(values: &[i32], dims: &[usize]) -> Result<Self> {
        Self::from_literal(TensorLiteral::from_i32(dims, values)?)
    }

    pub fn from_bool(values: &[bool], dims: &[usize]) -> Result<Self> {
        Self::from_literal(TensorLiteral::from_bool(dims, values)?)
    }

    pub fn scalar_f32(value: f32) -> Result<Self> {
        Self::from_f32(&[value], &[])
    }

    pub fn scalar_i32(value: i32) -> Result<Self> {
        Self::from_i32(&[value], &[])
    }

    pub fn full(dims: &[usize], value: f64, dtype: DType) -> Result<Self> {
        let count: usize = dims.iter().product();
        Self::from_literal(TensorLiteral::from_f64(dtype, dims, &vec![value; count])?)
    }

    pub fn zeros(dims: &[usize], dtype: DType) -> Result<Self> {
        Self::full(dims, 0.0, dtype)
    }

    pub fn ones(dims: &[usize], dtype: DType) -> Result<Self> {
        Self::full(dims, 1.0, dtype)
    }

    /// Records `op` over `inputs`, validating shapes eagerly.
    pub fn from_node(op: Operation, inputs: Vec<Array>) -> Result<Self> {
        let specs: Vec<TensorSpec> = inputs.iter().map(|input| input.spec().clone()).collect();
        let spec = infer_spec(&op, &specs)?;
        Ok(Self::from_node_with_spec(op, inputs, spec))
    }

    /// Records a node whose output spec was already inferred by the caller.
    pub(crate) fn from_node_with_spec(op: Operation, inputs: Vec<Array>, spec: TensorSpec) -> Self {
        if let Operation::Constant(literal) = &op {
            let literal = literal.clone();
            return Self::build(spec, Source::Data, OnceCell::with_value(literal));
        }
        Self::build(spec, Source::Node { op, inputs }, OnceCell::new())
    }

    pub(crate) fn placeholder(trace: TraceId, index: usize, spec: TensorSpec) -> Self {
        Self::build(spec, Source::Placeholder { trace, index }, OnceCell::new())
    }

    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    pub fn dtype(&self) -> DType {
        self.0.spec.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.dims
    }

    pub fn ndim(&self) -> usize {
        self.0.dims.len()
    }

    pub fn size(&self) -> usize {
        self.0.dims.iter().product()
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.0.spec
    }

    /// Returns the recorded operation for node arrays.
    pub fn op(&self) -> Option<&Operation> {
        match &self.0.source {
            Source::Node { op, .. } => Some(op),
            _ => None,
        }
    }

    pub fn inputs(&self) -> &[Array] {
        match &self.0.source {
            Source::Node { inputs, .. } => inputs,
            _ => &[],
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.0.data.get().is_some()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.0.source, Source::Placeholder { .. })
    }

    pub(crate) fn source(&self) -> &Source {
        &self.0.source
    }

    pub(crate) fn cached_data(&self) -> Option<&TensorLiteral> {
        self.0.data.get()
    }

    pub(crate) fn store_data(&self, literal: TensorLiteral) {
        // A concurrent evaluation may have won; both results are identical.
        let _ = self.0.data.set(literal);
    }

    /// Materializes this array through the default backend.
    pub fn eval(&self) -> Result<()> {
        crate::tensor::eval::eval(&[self])
    }

    /// Evaluates (if needed) and returns a copy of the host payload.
    pub fn to_literal(&self) -> Result<TensorLiteral> {
        if let Some(literal) = self.cached_data() {
            return Ok(literal.clone());
        }
        crate::tensor::eval::eval(&[self])?;
        self.cached_data()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("evaluation produced no data for array {:?}", self.id()))
    }

    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        Ok(self.to_literal()?.to_f32_vec())
    }

    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        Ok(self.to_literal()?.to_i32_vec())
    }

    pub fn to_vec_bool(&self) -> Result<Vec<bool>> {
        Ok(self.to_literal()?.to_bool_vec())
    }

    fn single(&self) -> Result<TensorLiteral> {
        ensure!(
            self.size() == 1,
            "item() requires a single element, array has shape {:?}",
            self.shape()
        );
        self.to_literal()
    }

    pub fn item_f32(&self) -> Result<f32> {
        Ok(self.single()?.to_f32_vec()[0])
    }

    pub fn item_i32(&self) -> Result<i32> {
        Ok(self.single()?.to_i32_vec()[0])
    }

    pub fn item_bool(&self) -> Result<bool> {
        Ok(self.single()?.to_bool_vec()[0])
    }

    /// Same shape and numerically equal elements (dtype-agnostic).
    pub fn array_equal(&self, other: &Array) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        let lhs = self.to_literal()?.to_f64_vec();
        let rhs = other.to_literal()?.to_f64_vec();
        Ok(lhs == rhs)
    }

    /// Same shape and `|a - b| <= atol + rtol * |b|` everywhere.
    pub fn allclose(&self, other: &Array, rtol: f64, atol: f64) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        let lhs = self.to_literal()?.to_f64_vec();
        let rhs = other.to_literal()?.to_f64_vec();
        Ok(lhs.iter().zip(rhs.iter()).all(|(a, b)| {
            if a.is_infinite() || b.is_infinite() {
                return a == b;
            }
            (a - b).abs() <= atol + rtol * b.abs()
        }))
    }

    /// Clone-free identity comparison.
    pub fn same(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0.source {
            Source::Data => "data".to_string(),
            Source::Placeholder { index, .. } => format!("placeholder#{index}"),
            Source::Node { op, .. } => op.label().into_owned(),
        };
        write!(
            f,
            "Array(id={}, {:?} {:?}, {kind})",
            self.0.id.0, self.0.spec.dtype, self.0.dims
        )
    }
}
