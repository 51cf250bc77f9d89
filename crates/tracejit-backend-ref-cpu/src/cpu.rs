use std::sync::Arc;

use tracejit::backend::fusion::{FusedSpec, FusionRef};
use tracejit::backend::shape_helpers::{infer_spec, resolve_index};
use tracejit::backend::spec::{
    BackendError, BackendResult, CompareSpec, ComparisonOp, DType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, FullLikeSpec, Operation, PortableBackend, ReduceKind, ReduceSpec,
    StackSpec, TakeSpec, TensorLiteral, TensorSpec, TransposeSpec,
};

#[derive(Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

#[derive(Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl CpuTensor {
    /// Packs `values` into the storage of `spec.dtype`. Integers truncate
    /// toward zero and saturate; booleans test against zero.
    fn from_values(spec: &TensorSpec, values: Vec<f64>) -> BackendResult<Self> {
        let dims = static_dims(spec)?;
        if values.len() != dims.iter().product::<usize>() {
            return Err(BackendError::execution(format!(
                "kernel produced {} elements for {:?}",
                values.len(),
                dims
            )));
        }
        let data = match spec.dtype {
            DType::F32 => TensorData::F32(values.iter().map(|&v| v as f32).collect()),
            DType::Si32 => TensorData::Si32(
                values
                    .iter()
                    .map(|&v| f64_to_i32_trunc_saturating(v))
                    .collect(),
            ),
            DType::I1 => TensorData::Bool(values.iter().map(|&v| u8::from(v != 0.0)).collect()),
        };
        Ok(Self {
            spec: spec.clone(),
            dims,
            data,
        })
    }

    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `idx` widened to `f64`.
    pub fn value(&self, idx: usize) -> f64 {
        match &self.data {
            TensorData::F32(values) => f64::from(values[idx]),
            TensorData::Si32(values) => f64::from(values[idx]),
            TensorData::Bool(values) => f64::from(values[idx]),
        }
    }

    fn values(&self) -> Vec<f64> {
        (0..self.len()).map(|idx| self.value(idx)).collect()
    }

    /// Same buffer under a new shape.
    fn relabel(&self, spec: &TensorSpec) -> BackendResult<Self> {
        let dims = static_dims(spec)?;
        if dims.iter().product::<usize>() != self.len() {
            return Err(BackendError::execution(format!(
                "cannot view {:?} as {:?}",
                self.dims, dims
            )));
        }
        if spec.dtype != self.spec.dtype {
            return Err(BackendError::execution("view changes dtype"));
        }
        Ok(Self {
            spec: spec.clone(),
            dims,
            data: self.data.clone(),
        })
    }
}

/// Hook consulted before every built-in kernel.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self { interceptor }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> PortableBackend for GenericCpuBackend<I> {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn execute(
        &self,
        op: &Operation,
        inputs: &[TensorLiteral],
        output: &TensorSpec,
    ) -> BackendResult<TensorLiteral> {
        let tensors = inputs
            .iter()
            .map(literal_to_tensor)
            .collect::<BackendResult<Vec<_>>>()?;
        let result = execute_operation(self.interceptor.as_ref(), op, &tensors, output)?;
        tensor_to_literal(&result)
    }
}

pub fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let dims = static_dims(&literal.spec)?;
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(bytes_to_f32(&literal.bytes)?)),
        DType::Si32 => TensorData::Si32(Arc::from(bytes_to_i32(&literal.bytes)?)),
        DType::I1 => TensorData::Bool(Arc::clone(&literal.bytes)),
    };
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        dims,
        data,
    })
}

pub fn tensor_to_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    match &tensor.data {
        TensorData::F32(values) => TensorLiteral::new(tensor.spec.clone(), f32_to_bytes(values)),
        TensorData::Si32(values) => TensorLiteral::new(tensor.spec.clone(), i32_to_bytes(values)),
        TensorData::Bool(values) => TensorLiteral::new(tensor.spec.clone(), Arc::clone(values)),
    }
}

pub fn execute_operation(
    interceptor: &dyn CpuKernelInterceptor,
    op: &Operation,
    inputs: &[CpuTensor],
    output: &TensorSpec,
) -> BackendResult<CpuTensor> {
    if let Some(result) = interceptor.try_execute(op, inputs, output) {
        return result;
    }

    match op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::FullLike(spec) => op_full_like(output, spec),
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op),
        Operation::Compare(spec) => op_compare(inputs, output, spec),
        Operation::Select => op_select(inputs, output),
        Operation::Cast(_) => op_cast(inputs, output),
        Operation::Reduce(spec) => op_reduce(inputs, output, spec),
        Operation::Reshape(_)
        | Operation::ReshapeLike
        | Operation::ExpandDims(_)
        | Operation::Squeeze(_)
        | Operation::Unflatten(_) => expect_first(inputs)?.relabel(output),
        Operation::Transpose(spec) => op_transpose(inputs, output, spec),
        Operation::BroadcastTo(_) | Operation::BroadcastLike => op_broadcast(inputs, output),
        Operation::ReduceToLike => op_reduce_to(inputs, output),
        Operation::Matmul => op_matmul(inputs, output),
        Operation::Take(spec) => op_take(inputs, output, spec),
        Operation::ScatterSlice(spec) => op_scatter_slice(inputs, output, spec),
        Operation::Stack(spec) => op_stack(inputs, output, spec),
        Operation::Fused(spec) => op_fused(interceptor, inputs, output, spec),
    }
}

fn op_full_like(output: &TensorSpec, spec: &FullLikeSpec) -> BackendResult<CpuTensor> {
    let count = static_dims(output)?.iter().product::<usize>();
    CpuTensor::from_values(output, vec![spec.value; count])
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = input.values();
    let result: Vec<f64> = match op {
        ElementwiseUnaryOp::Neg => values.iter().map(|&x| -x).collect(),
        ElementwiseUnaryOp::Abs => values.iter().map(|&x| x.abs()).collect(),
        ElementwiseUnaryOp::Exp => values.iter().map(|&x| x.exp()).collect(),
        ElementwiseUnaryOp::Log => values.iter().map(|&x| x.ln()).collect(),
        ElementwiseUnaryOp::Sin => values.iter().map(|&x| x.sin()).collect(),
        ElementwiseUnaryOp::Cos => values.iter().map(|&x| x.cos()).collect(),
        ElementwiseUnaryOp::Sqrt => values.iter().map(|&x| x.sqrt()).collect(),
        ElementwiseUnaryOp::Tanh => values.iter().map(|&x| x.tanh()).collect(),
        ElementwiseUnaryOp::IsInf => values
            .iter()
            .map(|&x| if x.is_infinite() { 1.0 } else { 0.0 })
            .collect(),
    };
    CpuTensor::from_values(output, result)
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution(
            "elementwise binary expects 2 inputs",
        ));
    }
    let out_dims = static_dims(output)?;
    let lhs = broadcast_map(&inputs[0].dims, &out_dims)?;
    let rhs = broadcast_map(&inputs[1].dims, &out_dims)?;
    let integer = output.dtype == DType::Si32;
    let result = lhs
        .iter()
        .zip(rhs.iter())
        .map(|(&l, &r)| {
            let (x, y) = (inputs[0].value(l), inputs[1].value(r));
            match op {
                ElementwiseBinaryOp::Add => x + y,
                ElementwiseBinaryOp::Sub => x - y,
                ElementwiseBinaryOp::Mul => x * y,
                ElementwiseBinaryOp::Div if integer => (x / y).floor(),
                ElementwiseBinaryOp::Div => x / y,
                ElementwiseBinaryOp::Maximum => nan_max(x, y),
                ElementwiseBinaryOp::Minimum => nan_min(x, y),
                ElementwiseBinaryOp::Pow => x.powf(y),
            }
        })
        .collect();
    CpuTensor::from_values(output, result)
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("compare expects two inputs"));
    }
    let out_dims = static_dims(output)?;
    let lhs = broadcast_map(&inputs[0].dims, &out_dims)?;
    let rhs = broadcast_map(&inputs[1].dims, &out_dims)?;
    let result = lhs
        .iter()
        .zip(rhs.iter())
        .map(|(&l, &r)| {
            let (x, y) = (inputs[0].value(l), inputs[1].value(r));
            let flag = match spec.op {
                ComparisonOp::Less => x < y,
                ComparisonOp::LessEqual => x <= y,
                ComparisonOp::Equal => x == y,
                ComparisonOp::GreaterEqual => x >= y,
                ComparisonOp::Greater => x > y,
                ComparisonOp::NotEqual => x != y,
            };
            if flag {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    CpuTensor::from_values(output, result)
}

fn op_select(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    if inputs.len() != 3 {
        return Err(BackendError::execution("select expects three operands"));
    }
    let out_dims = static_dims(output)?;
    let pred = broadcast_map(&inputs[0].dims, &out_dims)?;
    let on_true = broadcast_map(&inputs[1].dims, &out_dims)?;
    let on_false = broadcast_map(&inputs[2].dims, &out_dims)?;
    let result = (0..pred.len())
        .map(|idx| {
            if inputs[0].value(pred[idx]) != 0.0 {
                inputs[1].value(on_true[idx])
            } else {
                inputs[2].value(on_false[idx])
            }
        })
        .collect();
    CpuTensor::from_values(output, result)
}

fn op_cast(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if input.dims != static_dims(output)? {
        return Err(BackendError::execution("cast shape mismatch"));
    }
    if input.spec.dtype == output.dtype {
        return input.relabel(output);
    }
    CpuTensor::from_values(output, input.values())
}

fn op_reduce(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReduceSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = &input.dims;
    if spec.axes.iter().any(|&axis| axis >= dims.len()) {
        return Err(BackendError::execution("reduce axis out of range"));
    }
    let reduced: Vec<bool> = (0..dims.len()).map(|axis| spec.axes.contains(&axis)).collect();
    let kept: Vec<usize> = dims
        .iter()
        .zip(&reduced)
        .map(|(&dim, &r)| if r { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept);
    let init = match spec.kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0,
        ReduceKind::Max => f64::NEG_INFINITY,
        ReduceKind::Min => f64::INFINITY,
    };
    let mut acc = vec![init; kept.iter().product()];
    for idx in 0..input.len() {
        let coord = unravel_index(idx, dims);
        let dst: usize = coord
            .iter()
            .enumerate()
            .filter(|(axis, _)| !reduced[*axis])
            .map(|(axis, &c)| c * kept_strides[axis])
            .sum();
        let value = input.value(idx);
        acc[dst] = match spec.kind {
            ReduceKind::Sum | ReduceKind::Mean => acc[dst] + value,
            ReduceKind::Max => nan_max(acc[dst], value),
            ReduceKind::Min => nan_min(acc[dst], value),
        };
    }
    if spec.kind == ReduceKind::Mean {
        let count: usize = spec.axes.iter().map(|&axis| dims[axis]).product();
        for value in &mut acc {
            *value /= count as f64;
        }
    }
    CpuTensor::from_values(output, acc)
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if spec.perm.len() != input.dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims = static_dims(output)?;
    let input_strides = compute_strides(&input.dims);
    let result = (0..out_dims.iter().product::<usize>())
        .map(|idx| {
            let out_coord = unravel_index(idx, &out_dims);
            let in_index: usize = out_coord
                .iter()
                .enumerate()
                .map(|(out_axis, &c)| c * input_strides[spec.perm[out_axis]])
                .sum();
            input.value(in_index)
        })
        .collect();
    CpuTensor::from_values(output, result)
}

fn op_broadcast(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_first(inputs)?;
    let out_dims = static_dims(output)?;
    if input.dims == out_dims {
        return input.relabel(output);
    }
    let map = broadcast_map(&input.dims, &out_dims)?;
    CpuTensor::from_values(output, map.iter().map(|&src| input.value(src)).collect())
}

/// Sums operand 0 down to the output extents, undoing a broadcast.
fn op_reduce_to(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_first(inputs)?;
    let out_dims = static_dims(output)?;
    if out_dims.len() > input.dims.len() {
        return Err(BackendError::execution("sum-to target has higher rank"));
    }
    let offset = input.dims.len() - out_dims.len();
    let out_strides = compute_strides(&out_dims);
    let mut acc = vec![0.0f64; out_dims.iter().product()];
    for idx in 0..input.len() {
        let coord = unravel_index(idx, &input.dims);
        let dst: usize = out_dims
            .iter()
            .enumerate()
            .map(|(axis, &dim)| {
                if dim == 1 {
                    0
                } else {
                    coord[offset + axis] * out_strides[axis]
                }
            })
            .sum();
        acc[dst] += input.value(idx);
    }
    CpuTensor::from_values(output, acc)
}

fn op_matmul(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("matmul expects two operands"));
    }
    let (a, b) = (&inputs[0], &inputs[1]);
    let out_dims = static_dims(output)?;
    if a.dims.len() < 2 || b.dims.len() < 2 || out_dims.len() < 2 {
        return Err(BackendError::execution("matmul operands must have rank >= 2"));
    }
    let rank = out_dims.len();
    let (m, n) = (out_dims[rank - 2], out_dims[rank - 1]);
    let k = a.dims[a.dims.len() - 1];
    if b.dims[b.dims.len() - 2] != k {
        return Err(BackendError::execution("matmul contraction mismatch"));
    }
    let batch_dims = &out_dims[..rank - 2];
    let a_batch = broadcast_map(&a.dims[..a.dims.len() - 2], batch_dims)?;
    let b_batch = broadcast_map(&b.dims[..b.dims.len() - 2], batch_dims)?;

    let mut result = vec![0.0f64; out_dims.iter().product()];
    for (batch, (&a_idx, &b_idx)) in a_batch.iter().zip(b_batch.iter()).enumerate() {
        let a_off = a_idx * m * k;
        let b_off = b_idx * k * n;
        let out_off = batch * m * n;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f64;
                for p in 0..k {
                    acc += a.value(a_off + i * k + p) * b.value(b_off + p * n + j);
                }
                result[out_off + i * n + j] = acc;
            }
        }
    }
    CpuTensor::from_values(output, result)
}

fn resolve_position(spec: &TakeSpec, extent: usize) -> BackendResult<usize> {
    resolve_index(spec.index, extent).ok_or_else(|| {
        BackendError::execution(format!(
            "index {} out of bounds for extent {extent}",
            spec.index
        ))
    })
}

/// Flat offset in a tensor with `strides` of `coord` with `position`
/// inserted at `axis`.
fn offset_with_axis(coord: &[usize], strides: &[usize], axis: usize, position: usize) -> usize {
    let mut offset = position * strides[axis];
    for (pos, &c) in coord.iter().enumerate() {
        let full_axis = if pos < axis { pos } else { pos + 1 };
        offset += c * strides[full_axis];
    }
    offset
}

fn op_take(inputs: &[CpuTensor], output: &TensorSpec, spec: &TakeSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if spec.axis >= input.dims.len() {
        return Err(BackendError::execution("take axis out of range"));
    }
    let position = resolve_position(spec, input.dims[spec.axis])?;
    let out_dims = static_dims(output)?;
    let strides = compute_strides(&input.dims);
    let result = (0..out_dims.iter().product::<usize>())
        .map(|idx| {
            let coord = unravel_index(idx, &out_dims);
            input.value(offset_with_axis(&coord, &strides, spec.axis, position))
        })
        .collect();
    CpuTensor::from_values(output, result)
}

fn op_scatter_slice(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TakeSpec,
) -> BackendResult<CpuTensor> {
    let slice = expect_first(inputs)?;
    let out_dims = static_dims(output)?;
    if spec.axis >= out_dims.len() {
        return Err(BackendError::execution("scatter axis out of range"));
    }
    let position = resolve_position(spec, out_dims[spec.axis])?;
    let strides = compute_strides(&out_dims);
    let mut result = vec![0.0f64; out_dims.iter().product()];
    for idx in 0..slice.len() {
        let coord = unravel_index(idx, &slice.dims);
        result[offset_with_axis(&coord, &strides, spec.axis, position)] = slice.value(idx);
    }
    CpuTensor::from_values(output, result)
}

fn op_stack(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &StackSpec,
) -> BackendResult<CpuTensor> {
    let first = expect_first(inputs)?;
    let out_dims = static_dims(output)?;
    let strides = compute_strides(&first.dims);
    let result = (0..out_dims.iter().product::<usize>())
        .map(|idx| {
            let mut coord = unravel_index(idx, &out_dims);
            let which = coord.remove(spec.axis);
            let src: usize = coord.iter().zip(&strides).map(|(c, s)| c * s).sum();
            inputs[which].value(src)
        })
        .collect();
    CpuTensor::from_values(output, result)
}

/// Runs the sub-operations of a fused unit one after another on host buffers.
fn op_fused(
    interceptor: &dyn CpuKernelInterceptor,
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &FusedSpec,
) -> BackendResult<CpuTensor> {
    let mut nodes: Vec<CpuTensor> = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        let args = node
            .args
            .iter()
            .map(|arg| {
                let source = match *arg {
                    FusionRef::Input(idx) => inputs.get(idx),
                    FusionRef::Node(idx) => nodes.get(idx),
                };
                source.cloned().ok_or_else(|| {
                    BackendError::execution(format!("{}: dangling reference", spec.label))
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let op = node.op.to_operation();
        let arg_specs: Vec<TensorSpec> = args.iter().map(|arg| arg.spec.clone()).collect();
        let node_spec =
            infer_spec(&op, &arg_specs).map_err(|err| BackendError::execution(err.to_string()))?;
        nodes.push(execute_operation(interceptor, &op, &args, &node_spec)?);
    }
    let result = nodes
        .pop()
        .ok_or_else(|| BackendError::execution(format!("{} has no nodes", spec.label)))?;
    if result.spec != *output {
        return Err(BackendError::execution(format!(
            "{} produced {:?} {:?}, expected {:?}",
            spec.label, result.spec.dtype, result.dims, output
        )));
    }
    Ok(result)
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

/// Shape-reference ops read their data from operand 0 only.
fn expect_first(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    inputs
        .first()
        .ok_or_else(|| BackendError::execution("operation expects at least one input"))
}

fn static_dims(spec: &TensorSpec) -> BackendResult<Vec<usize>> {
    spec.shape.static_dims().ok_or_else(|| {
        BackendError::execution("dynamic dimension not supported at runtime")
    })
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// For each output position, the flat position of its source element when
/// `input_dims` is broadcast to `out_dims` (trailing axes aligned).
fn broadcast_map(input_dims: &[usize], out_dims: &[usize]) -> BackendResult<Vec<usize>> {
    if input_dims.len() > out_dims.len() {
        return Err(BackendError::execution(format!(
            "cannot broadcast {input_dims:?} to {out_dims:?}"
        )));
    }
    let offset = out_dims.len() - input_dims.len();
    for (axis, &dim) in input_dims.iter().enumerate() {
        if dim != 1 && dim != out_dims[offset + axis] {
            return Err(BackendError::execution(format!(
                "cannot broadcast {input_dims:?} to {out_dims:?}"
            )));
        }
    }
    let in_strides = compute_strides(input_dims);
    Ok((0..out_dims.iter().product::<usize>())
        .map(|idx| {
            let coord = unravel_index(idx, out_dims);
            input_dims
                .iter()
                .enumerate()
                .filter(|(_, dim)| **dim != 1)
                .map(|(axis, _)| coord[offset + axis] * in_strides[axis])
                .sum()
        })
        .collect())
}

fn f64_to_i32_trunc_saturating(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let truncated = value.trunc();
    if truncated > f64::from(i32::MAX) {
        i32::MAX
    } else if truncated < f64::from(i32::MIN) {
        i32::MIN
    } else {
        truncated as i32
    }
}

fn bytes_to_f32(bytes: &[u8]) -> BackendResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches f32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn bytes_to_i32(bytes: &[u8]) -> BackendResult<Vec<i32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches i32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn f32_to_bytes(values: &[f32]) -> Arc<[u8]> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Arc::from(bytes.into_boxed_slice())
}

fn i32_to_bytes(values: &[i32]) -> Arc<[u8]> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Arc::from(bytes.into_boxed_slice())
}
