use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::backend::spec::{ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, ReduceKind};
use crate::compile::Function;
use crate::error::CompileError;
use crate::tensor::{Array, ArrayId};
use crate::transforms::{axes_isize, dependent_nodes, expand_fused};

/// Evaluates `function` at `primals` and pushes `tangents` (one per primal,
/// same shapes) forward to every array output.
pub fn jvp(
    function: &Function,
    primals: &[Array],
    tangents: &[Array],
) -> Result<(Vec<Array>, Vec<Array>)> {
    if primals.len() != tangents.len() {
        return Err(CompileError::invalid(format!(
            "jvp of {} got {} primals but {} tangents",
            function.name(),
            primals.len(),
            tangents.len()
        ))
        .into());
    }
    for (primal, tangent) in primals.iter().zip(tangents) {
        if primal.shape() != tangent.shape() {
            return Err(CompileError::invalid(format!(
                "tangent shape {:?} does not match primal shape {:?}",
                tangent.shape(),
                primal.shape()
            ))
            .into());
        }
    }
    let outputs = function.call_arrays(primals)?;
    let output_tangents = forward(&outputs, primals, tangents)?;
    Ok((outputs, output_tangents))
}

/// Forward sweep. When the same array is listed twice as a primal, the first
/// tangent wins. Outputs that do not depend on any primal get zeros.
pub(crate) fn forward(
    outputs: &[Array],
    primals: &[Array],
    tangents: &[Array],
) -> Result<Vec<Array>> {
    let mut store: HashMap<ArrayId, Array> = HashMap::new();
    for (primal, tangent) in primals.iter().zip(tangents) {
        store.entry(primal.id()).or_insert_with(|| tangent.clone());
    }
    let stops: HashSet<ArrayId> = primals.iter().map(Array::id).collect();

    for node in dependent_nodes(outputs, &stops) {
        let Some(op) = node.op() else {
            continue;
        };
        let input_tangents: Vec<Option<Array>> = node
            .inputs()
            .iter()
            .map(|input| store.get(&input.id()).cloned())
            .collect();
        if input_tangents.iter().all(Option::is_none) {
            continue;
        }
        if let Some(tangent) = jvp_rule(op, &node, &input_tangents)? {
            store.insert(node.id(), fit(tangent, &node)?);
        }
    }

    outputs
        .iter()
        .map(|output| match store.get(&output.id()) {
            Some(tangent) => Ok(tangent.clone()),
            None => output.zeros_like(),
        })
        .collect()
}

/// Tangents of broadcasting ops can come out smaller than the node.
fn fit(tangent: Array, node: &Array) -> Result<Array> {
    let tangent = if tangent.shape() != node.shape() {
        tangent.broadcast_like(node)?
    } else {
        tangent
    };
    if node.dtype().is_float() {
        tangent.astype(node.dtype())
    } else {
        Ok(tangent)
    }
}

fn or_zeros(tangent: &Option<Array>, like: &Array) -> Result<Array> {
    match tangent {
        Some(tangent) => Ok(tangent.clone()),
        None => like.zeros_like(),
    }
}

fn unary_jvp(op: ElementwiseUnaryOp, x: &Array, y: &Array, t: &Array) -> Result<Option<Array>> {
    let tangent = match op {
        ElementwiseUnaryOp::Neg => t.neg()?,
        ElementwiseUnaryOp::Abs => {
            let zero = Array::scalar_like(0.0, x)?;
            let zeros = t.zeros_like()?;
            let negative = Array::select(&x.less(&zero)?, &t.neg()?, &zeros)?;
            Array::select(&x.greater(&zero)?, t, &negative)?
        }
        ElementwiseUnaryOp::Exp => t.mul(y)?,
        ElementwiseUnaryOp::Log => t.div(x)?,
        ElementwiseUnaryOp::Sin => t.mul(&x.cos()?)?,
        ElementwiseUnaryOp::Cos => t.mul(&x.sin()?)?.neg()?,
        ElementwiseUnaryOp::Sqrt => t.div(&y.mul_scalar(2.0)?)?,
        ElementwiseUnaryOp::Tanh => t.mul(&y.mul(y)?.neg()?.add_scalar(1.0)?)?,
        ElementwiseUnaryOp::IsInf => return Ok(None),
    };
    Ok(Some(tangent))
}

fn binary_jvp(
    op: ElementwiseBinaryOp,
    a: &Array,
    b: &Array,
    y: &Array,
    ta: &Option<Array>,
    tb: &Option<Array>,
) -> Result<Array> {
    let terms: [Option<Array>; 2] = match op {
        ElementwiseBinaryOp::Add => [ta.clone(), tb.clone()],
        ElementwiseBinaryOp::Sub => [ta.clone(), tb.as_ref().map(Array::neg).transpose()?],
        ElementwiseBinaryOp::Mul => [
            ta.as_ref().map(|t| t.mul(b)).transpose()?,
            tb.as_ref().map(|t| t.mul(a)).transpose()?,
        ],
        ElementwiseBinaryOp::Div => [
            ta.as_ref().map(|t| t.div(b)).transpose()?,
            tb.as_ref()
                .map(|t| t.mul(y)?.div(b)?.neg())
                .transpose()?,
        ],
        ElementwiseBinaryOp::Maximum | ElementwiseBinaryOp::Minimum => {
            let pick_a = if op == ElementwiseBinaryOp::Maximum {
                a.greater_equal(b)?
            } else {
                a.less_equal(b)?
            };
            let picked = Array::select(&pick_a, &or_zeros(ta, a)?, &or_zeros(tb, b)?)?;
            return Ok(picked);
        }
        ElementwiseBinaryOp::Pow => [
            ta.as_ref()
                .map(|t| t.mul(b)?.mul(&a.pow(&b.sub_scalar(1.0)?)?))
                .transpose()?,
            tb.as_ref().map(|t| t.mul(y)?.mul(&a.log()?)).transpose()?,
        ],
    };
    match terms {
        [Some(lhs), Some(rhs)] => lhs.add(&rhs),
        [Some(only), None] | [None, Some(only)] => Ok(only),
        [None, None] => y.zeros_like(),
    }
}

/// Tangent of `node` given the tangents of its inputs; `None` means zero.
fn jvp_rule(op: &Operation, node: &Array, tangents: &[Option<Array>]) -> Result<Option<Array>> {
    let inputs = node.inputs();
    let first = || tangents.first().cloned().flatten();

    Ok(match op {
        Operation::Constant(_) | Operation::FullLike(_) | Operation::Compare(_) => None,
        Operation::ElementwiseUnary(unary) => match first() {
            Some(t) => unary_jvp(*unary, &inputs[0], node, &t)?,
            None => None,
        },
        Operation::ElementwiseBinary(binary) => Some(binary_jvp(
            *binary,
            &inputs[0],
            &inputs[1],
            node,
            &tangents[0],
            &tangents[1],
        )?),
        Operation::Select => {
            if tangents[1].is_none() && tangents[2].is_none() {
                None
            } else {
                Some(Array::select(
                    &inputs[0],
                    &or_zeros(&tangents[1], &inputs[1])?,
                    &or_zeros(&tangents[2], &inputs[2])?,
                )?)
            }
        }
        Operation::Cast(spec) => match first() {
            Some(t) if spec.dtype.is_float() => Some(t.astype(spec.dtype)?),
            _ => None,
        },
        Operation::Reduce(spec) => match first() {
            Some(t) => {
                let axes = axes_isize(&spec.axes);
                Some(match spec.kind {
                    ReduceKind::Sum => t.sum(&axes, spec.keepdims)?,
                    ReduceKind::Mean => t.mean(&axes, spec.keepdims)?,
                    ReduceKind::Max | ReduceKind::Min => {
                        let x = &inputs[0];
                        let extremum = if spec.keepdims {
                            node.clone()
                        } else {
                            node.expand_dims(&axes)?
                        };
                        let mask = x.equal(&extremum)?.astype(t.dtype())?;
                        let count = mask.sum(&axes, true)?;
                        t.mul(&mask)?.sum(&axes, true)?.div(&count)?.reshape_like(node)?
                    }
                })
            }
            None => None,
        },
        Operation::Reshape(_)
        | Operation::ReshapeLike
        | Operation::ExpandDims(_)
        | Operation::Squeeze(_)
        | Operation::Unflatten(_) => first().map(|t| t.reshape_like(node)).transpose()?,
        Operation::Transpose(spec) => first().map(|t| t.transpose(&spec.perm)).transpose()?,
        Operation::BroadcastTo(_) | Operation::BroadcastLike => {
            first().map(|t| t.broadcast_like(node)).transpose()?
        }
        Operation::ReduceToLike => first().map(|t| t.sum_to_like(node)).transpose()?,
        Operation::Matmul => {
            let (a, b) = (&inputs[0], &inputs[1]);
            let lhs = tangents[0].as_ref().map(|t| t.matmul(b)).transpose()?;
            let rhs = tangents[1].as_ref().map(|t| a.matmul(t)).transpose()?;
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => Some(lhs.add(&rhs)?),
                (lhs, rhs) => lhs.or(rhs),
            }
        }
        Operation::Take(spec) => first()
            .map(|t| t.take(spec.axis as isize, spec.index))
            .transpose()?,
        Operation::ScatterSlice(spec) => first()
            .map(|t| {
                Array::from_node(
                    Operation::ScatterSlice(spec.clone()),
                    vec![t, inputs[1].clone()],
                )
            })
            .transpose()?,
        Operation::Stack(spec) => {
            let parts = inputs
                .iter()
                .zip(tangents)
                .map(|(input, tangent)| or_zeros(tangent, input))
                .collect::<Result<Vec<_>>>()?;
            Some(Array::stack(&parts, spec.axis as isize)?)
        }
        Operation::Fused(spec) => {
            let expanded = expand_fused(spec, inputs)?;
            let (seeded, seeds): (Vec<Array>, Vec<Array>) = inputs
                .iter()
                .zip(tangents)
                .filter_map(|(input, tangent)| tangent.clone().map(|t| (input.clone(), t)))
                .unzip();
            forward(&[expanded], &seeded, &seeds)?.pop()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(array: &Array) -> Option<String> {
        array.op().map(|op| op.label().into_owned())
    }

    #[test]
    fn tangent_of_product_sums_both_terms() -> Result<()> {
        let x = Array::from_f32(&[1.0, 2.0], &[2])?;
        let y = Array::from_f32(&[3.0, 4.0], &[2])?;
        let out = x.mul(&y)?;
        let tangents = forward(
            &[out.clone()],
            &[x.clone(), y.clone()],
            &[x.ones_like()?, y.ones_like()?],
        )?;
        assert_eq!(label(&tangents[0]).as_deref(), Some("Add"));
        assert_eq!(tangents[0].shape(), out.shape());
        Ok(())
    }

    #[test]
    fn outputs_independent_of_primals_get_zeros() -> Result<()> {
        let x = Array::from_f32(&[1.0], &[1])?;
        let c = Array::from_f32(&[2.0, 3.0], &[2])?;
        let out = c.exp()?;
        let tangents = forward(&[out], &[x.clone()], &[x.ones_like()?])?;
        assert_eq!(label(&tangents[0]).as_deref(), Some("Full"));
        assert_eq!(tangents[0].shape(), &[2]);
        Ok(())
    }

    #[test]
    fn first_seed_wins_for_repeated_primals() -> Result<()> {
        let x = Array::from_f32(&[1.0], &[1])?;
        let first = Array::from_f32(&[5.0], &[1])?;
        let second = Array::from_f32(&[7.0], &[1])?;
        let tangents = forward(&[x.clone()], &[x.clone(), x], &[first.clone(), second])?;
        assert!(tangents[0].same(&first));
        Ok(())
    }
}
