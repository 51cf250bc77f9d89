use std::{borrow::Cow, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::backend::fusion::FusedSpec;

/// Scalar element types understood by graphs and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    F32,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si32 | DType::F32 => 4,
        }
    }

    /// Result dtype of a binary op over `self` and `other` (`I1 < Si32 < F32`).
    pub fn promote(self, other: DType) -> DType {
        self.max(other)
    }
}

/// Names a symbolic dynamic dimension (e.g. `?d0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn concrete(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::from_static(dims))
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// Dense little-endian host payload paired with its spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> BackendResult<Self> {
        let expected = spec.byte_len().ok_or_else(|| {
            BackendError::execution("literal spec must have static dims")
        })?;
        if expected != bytes.len() {
            return Err(BackendError::execution(format!(
                "literal byte length {} does not match spec ({expected} bytes)",
                bytes.len()
            )));
        }
        Ok(Self { spec, bytes })
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> BackendResult<Self> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::concrete(DType::F32, dims), Arc::from(bytes))
    }

    pub fn from_i32(dims: &[usize], values: &[i32]) -> BackendResult<Self> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::concrete(DType::Si32, dims), Arc::from(bytes))
    }

    pub fn from_bool(dims: &[usize], values: &[bool]) -> BackendResult<Self> {
        let bytes: Vec<u8> = values.iter().map(|&v| u8::from(v)).collect();
        Self::new(TensorSpec::concrete(DType::I1, dims), Arc::from(bytes))
    }

    /// Encodes `values` as `dtype`, truncating toward zero for integers.
    pub fn from_f64(dtype: DType, dims: &[usize], values: &[f64]) -> BackendResult<Self> {
        match dtype {
            DType::F32 => {
                let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
                Self::from_f32(dims, &values)
            }
            DType::Si32 => {
                let values: Vec<i32> = values.iter().map(|&v| v as i32).collect();
                Self::from_i32(dims, &values)
            }
            DType::I1 => {
                let values: Vec<bool> = values.iter().map(|&v| v != 0.0).collect();
                Self::from_bool(dims, &values)
            }
        }
    }

    pub fn scalar(dtype: DType, value: f64) -> BackendResult<Self> {
        Self::from_f64(dtype, &[], &[value])
    }

    pub fn dims(&self) -> Vec<usize> {
        self.spec.shape.static_dims().unwrap_or_default()
    }

    pub fn element_count(&self) -> usize {
        self.bytes.len() / self.spec.dtype.size_in_bytes()
    }

    /// Widens every element to `f64` regardless of dtype.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.spec.dtype {
            DType::F32 => self
                .bytes
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            DType::Si32 => self
                .bytes
                .chunks_exact(4)
                .map(|c| f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            DType::I1 => self
                .bytes
                .iter()
                .map(|&b| if b != 0 { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.spec.dtype {
            DType::F32 => self
                .bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
        }
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        match self.spec.dtype {
            DType::Si32 => self
                .bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as i32).collect(),
        }
    }

    pub fn to_bool_vec(&self) -> Vec<bool> {
        self.to_f64_vec().into_iter().map(|v| v != 0.0).collect()
    }
}

/// Comparator used by the `compare` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sin,
    Cos,
    Sqrt,
    Tanh,
    IsInf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
    Mean,
}

/// Configuration shared by all reductions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Entry in the requested output shape for `reshape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshapeDim {
    Explicit(usize),
    Infer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<ReshapeDim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attribute payload for `broadcast_to`; the target is fixed at trace time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Vec<usize>,
}

/// Output axes inserted by `expand_dims`, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpandDimsSpec {
    pub axes: Vec<usize>,
}

/// Input axes removed by `squeeze`, sorted; each must have extent 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqueezeSpec {
    pub axes: Vec<usize>,
}

/// Splits one axis into several; at most one entry may be inferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnflattenSpec {
    pub axis: usize,
    pub sizes: Vec<ReshapeDim>,
}

/// Selects a single position along `axis` and drops that axis. Negative
/// indices count from the end and are resolved against the bound shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TakeSpec {
    pub axis: usize,
    pub index: isize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullLikeSpec {
    pub value: f64,
    pub dtype: DType,
}

/// Unique identifier for SSA values in a compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Declarative form of graph operations.
///
/// `*Like` variants take their result shape from a second operand instead of
/// a baked attribute, which keeps them valid when a shapeless graph is bound
/// to new input extents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    /// Fills the shape of operand 0 with a scalar.
    FullLike(FullLikeSpec),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Compare(CompareSpec),
    /// `where(cond, on_true, on_false)` with implicit broadcasting.
    Select,
    Cast(CastSpec),
    Reduce(ReduceSpec),
    Reshape(ReshapeSpec),
    /// Reshapes operand 0 to the shape of operand 1.
    ReshapeLike,
    Transpose(TransposeSpec),
    BroadcastTo(BroadcastToSpec),
    /// Broadcasts operand 0 to the common broadcast shape of all operands.
    BroadcastLike,
    /// Sums operand 0 down to the shape of operand 1 (inverse of broadcasting).
    ReduceToLike,
    ExpandDims(ExpandDimsSpec),
    Squeeze(SqueezeSpec),
    Unflatten(UnflattenSpec),
    Matmul,
    Take(TakeSpec),
    /// Transpose of `Take`: places operand 0 at `index` of a zero tensor shaped like operand 1.
    ScatterSlice(TakeSpec),
    Stack(StackSpec),
    Fused(FusedSpec),
}

impl Operation {
    /// Human-readable operation name used by the text IR and the dot export.
    pub fn label(&self) -> Cow<'_, str> {
        let name = match self {
            Operation::Constant(_) => "Constant",
            Operation::FullLike(_) => "Full",
            Operation::ElementwiseUnary(op) => unary_name(*op),
            Operation::ElementwiseBinary(op) => binary_name(*op),
            Operation::Compare(spec) => compare_name(spec.op),
            Operation::Select => "Select",
            Operation::Cast(_) => "AsType",
            Operation::Reduce(spec) => match spec.kind {
                ReduceKind::Sum => "Sum",
                ReduceKind::Max => "Max",
                ReduceKind::Min => "Min",
                ReduceKind::Mean => "Mean",
            },
            Operation::Reshape(_) | Operation::ReshapeLike => "Reshape",
            Operation::Transpose(_) => "Transpose",
            Operation::BroadcastTo(_) | Operation::BroadcastLike => "Broadcast",
            Operation::ReduceToLike => "SumToShape",
            Operation::ExpandDims(_) => "ExpandDims",
            Operation::Squeeze(_) => "Squeeze",
            Operation::Unflatten(_) => "Unflatten",
            Operation::Matmul => "Matmul",
            Operation::Take(_) => "Take",
            Operation::ScatterSlice(_) => "ScatterSlice",
            Operation::Stack(_) => "Stack",
            Operation::Fused(spec) => return Cow::Borrowed(spec.label.as_str()),
        };
        Cow::Borrowed(name)
    }

    /// Elementwise ops whose output extent is the broadcast of their operands.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Operation::ElementwiseUnary(_)
                | Operation::ElementwiseBinary(_)
                | Operation::Compare(_)
                | Operation::Select
                | Operation::Cast(_)
        )
    }

    /// Ops that only change shape metadata by broadcasting.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Operation::BroadcastTo(_) | Operation::BroadcastLike)
    }
}

pub(crate) fn unary_name(op: ElementwiseUnaryOp) -> &'static str {
    match op {
        ElementwiseUnaryOp::Neg => "Negative",
        ElementwiseUnaryOp::Abs => "Abs",
        ElementwiseUnaryOp::Exp => "Exp",
        ElementwiseUnaryOp::Log => "Log",
        ElementwiseUnaryOp::Sin => "Sin",
        ElementwiseUnaryOp::Cos => "Cos",
        ElementwiseUnaryOp::Sqrt => "Sqrt",
        ElementwiseUnaryOp::Tanh => "Tanh",
        ElementwiseUnaryOp::IsInf => "IsInf",
    }
}

pub(crate) fn binary_name(op: ElementwiseBinaryOp) -> &'static str {
    match op {
        ElementwiseBinaryOp::Add => "Add",
        ElementwiseBinaryOp::Sub => "Subtract",
        ElementwiseBinaryOp::Mul => "Multiply",
        ElementwiseBinaryOp::Div => "Divide",
        ElementwiseBinaryOp::Maximum => "Maximum",
        ElementwiseBinaryOp::Minimum => "Minimum",
        ElementwiseBinaryOp::Pow => "Power",
    }
}

pub(crate) fn compare_name(op: ComparisonOp) -> &'static str {
    match op {
        ComparisonOp::Less => "Less",
        ComparisonOp::LessEqual => "LessEqual",
        ComparisonOp::Equal => "Equal",
        ComparisonOp::GreaterEqual => "GreaterEqual",
        ComparisonOp::Greater => "Greater",
        ComparisonOp::NotEqual => "NotEqual",
    }
}

pub(crate) fn format_spec(spec: &TensorSpec) -> String {
    format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
}

pub(crate) fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

pub(crate) fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    Unimplemented { op: String, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Kernel provider contract. Backends receive fully inferred output specs and
/// must not reinterpret shapes.
pub trait PortableBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    fn execute(
        &self,
        op: &Operation,
        inputs: &[TensorLiteral],
        output: &TensorSpec,
    ) -> BackendResult<TensorLiteral>;
}
