use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::backend::spec::{
    ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, ReduceKind, ReduceSpec,
};
use crate::compile::Function;
use crate::error::CompileError;
use crate::tensor::{Array, ArrayId};
use crate::transforms::{axes_isize, dependent_nodes, expand_fused};

/// Accumulated cotangents keyed by array identity. An array used by several
/// nodes receives the sum of their contributions.
#[derive(Default)]
struct GradStore {
    grads: HashMap<ArrayId, Array>,
}

impl GradStore {
    fn get(&self, id: ArrayId) -> Option<&Array> {
        self.grads.get(&id)
    }

    fn accumulate(&mut self, id: ArrayId, grad: Array) -> Result<()> {
        let grad = match self.grads.remove(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, grad);
        Ok(())
    }
}

/// Evaluates `function` at `primals` and pulls `cotangents` (one per array
/// output) back to the primals.
pub fn vjp(
    function: &Function,
    primals: &[Array],
    cotangents: &[Array],
) -> Result<(Vec<Array>, Vec<Array>)> {
    let outputs = function.call_arrays(primals)?;
    if outputs.len() != cotangents.len() {
        return Err(CompileError::invalid(format!(
            "vjp of {} needs {} cotangents, got {}",
            function.name(),
            outputs.len(),
            cotangents.len()
        ))
        .into());
    }
    for (output, cotangent) in outputs.iter().zip(cotangents) {
        if output.shape() != cotangent.shape() {
            return Err(CompileError::invalid(format!(
                "cotangent shape {:?} does not match output shape {:?}",
                cotangent.shape(),
                output.shape()
            ))
            .into());
        }
    }
    let grads = backward(&outputs, cotangents, primals)?;
    Ok((outputs, grads))
}

/// Reverse sweep from `outputs` to `primals`. Primals that receive no
/// contribution get zeros; a primal listed twice gets the shared total.
pub(crate) fn backward(
    outputs: &[Array],
    cotangents: &[Array],
    primals: &[Array],
) -> Result<Vec<Array>> {
    let stops: HashSet<ArrayId> = primals.iter().map(Array::id).collect();
    let order = dependent_nodes(outputs, &stops);
    let mut relevant: HashSet<ArrayId> = order.iter().map(Array::id).collect();
    relevant.extend(stops.iter().copied());

    let mut store = GradStore::default();
    for (output, cotangent) in outputs.iter().zip(cotangents) {
        if relevant.contains(&output.id()) {
            store.accumulate(output.id(), cotangent.clone())?;
        }
    }

    for node in order.iter().rev() {
        let Some(cotangent) = store.get(node.id()).cloned() else {
            continue;
        };
        let Some(op) = node.op() else {
            continue;
        };
        let input_grads = vjp_rule(op, node, &cotangent)?;
        for (input, grad) in node.inputs().iter().zip(input_grads) {
            let Some(grad) = grad else {
                continue;
            };
            if relevant.contains(&input.id()) && input.dtype().is_float() {
                store.accumulate(input.id(), grad)?;
            }
        }
    }

    primals
        .iter()
        .map(|primal| match store.get(primal.id()) {
            Some(grad) => Ok(grad.clone()),
            None => primal.zeros_like(),
        })
        .collect()
}

/// `g` with the reduced axes reinserted so it broadcasts against the operand.
fn unreduce(g: &Array, spec: &ReduceSpec) -> Result<Array> {
    if spec.keepdims {
        Ok(g.clone())
    } else {
        g.expand_dims(&axes_isize(&spec.axes))
    }
}

fn extremum_mask(x: &Array, y: &Array, spec: &ReduceSpec) -> Result<(Array, Array)> {
    let mask = x.equal(&unreduce(y, spec)?)?.astype(x.dtype())?;
    let count = mask.sum(&axes_isize(&spec.axes), true)?;
    Ok((mask, count))
}

fn unary_vjp(op: ElementwiseUnaryOp, x: &Array, y: &Array, g: &Array) -> Result<Option<Array>> {
    let grad = match op {
        ElementwiseUnaryOp::Neg => g.neg()?,
        ElementwiseUnaryOp::Abs => {
            let zero = Array::scalar_like(0.0, x)?;
            let zeros = g.zeros_like()?;
            let negative = Array::select(&x.less(&zero)?, &g.neg()?, &zeros)?;
            Array::select(&x.greater(&zero)?, g, &negative)?
        }
        ElementwiseUnaryOp::Exp => g.mul(y)?,
        ElementwiseUnaryOp::Log => g.div(x)?,
        ElementwiseUnaryOp::Sin => g.mul(&x.cos()?)?,
        ElementwiseUnaryOp::Cos => g.mul(&x.sin()?)?.neg()?,
        ElementwiseUnaryOp::Sqrt => g.div(&y.mul_scalar(2.0)?)?,
        ElementwiseUnaryOp::Tanh => g.mul(&y.mul(y)?.neg()?.add_scalar(1.0)?)?,
        ElementwiseUnaryOp::IsInf => return Ok(None),
    };
    Ok(Some(grad))
}

fn binary_vjp(
    op: ElementwiseBinaryOp,
    a: &Array,
    b: &Array,
    y: &Array,
    g: &Array,
) -> Result<Vec<Option<Array>>> {
    let (ga, gb) = match op {
        ElementwiseBinaryOp::Add => (g.clone(), g.clone()),
        ElementwiseBinaryOp::Sub => (g.clone(), g.neg()?),
        ElementwiseBinaryOp::Mul => (g.mul(b)?, g.mul(a)?),
        ElementwiseBinaryOp::Div => (g.div(b)?, g.mul(y)?.div(b)?.neg()?),
        ElementwiseBinaryOp::Maximum | ElementwiseBinaryOp::Minimum => {
            let pick_a = if op == ElementwiseBinaryOp::Maximum {
                a.greater_equal(b)?
            } else {
                a.less_equal(b)?
            };
            let zeros = g.zeros_like()?;
            (
                Array::select(&pick_a, g, &zeros)?,
                Array::select(&pick_a, &zeros, g)?,
            )
        }
        ElementwiseBinaryOp::Pow => (
            g.mul(b)?.mul(&a.pow(&b.sub_scalar(1.0)?)?)?,
            g.mul(y)?.mul(&a.log()?)?,
        ),
    };
    Ok(vec![Some(ga.sum_to_like(a)?), Some(gb.sum_to_like(b)?)])
}

/// Cotangent of each input of `node` given the cotangent `g` of its output.
fn vjp_rule(op: &Operation, node: &Array, g: &Array) -> Result<Vec<Option<Array>>> {
    let inputs = node.inputs();
    let arity = inputs.len();
    let first = |grad: Array| -> Vec<Option<Array>> {
        let mut grads = vec![None; arity];
        if let Some(slot) = grads.first_mut() {
            *slot = Some(grad);
        }
        grads
    };

    Ok(match op {
        Operation::Constant(_)
        | Operation::FullLike(_)
        | Operation::Compare(_) => vec![None; arity],
        Operation::ElementwiseUnary(unary) => vec![unary_vjp(*unary, &inputs[0], node, g)?],
        Operation::ElementwiseBinary(binary) => {
            binary_vjp(*binary, &inputs[0], &inputs[1], node, g)?
        }
        Operation::Select => {
            let zeros = g.zeros_like()?;
            vec![
                None,
                Some(Array::select(&inputs[0], g, &zeros)?.sum_to_like(&inputs[1])?),
                Some(Array::select(&inputs[0], &zeros, g)?.sum_to_like(&inputs[2])?),
            ]
        }
        Operation::Cast(_) => {
            let x = &inputs[0];
            if x.dtype().is_float() {
                first(g.astype(x.dtype())?)
            } else {
                vec![None]
            }
        }
        Operation::Reduce(spec) => {
            let x = &inputs[0];
            let spread = unreduce(g, spec)?.broadcast_like(x)?;
            let grad = match spec.kind {
                ReduceKind::Sum => spread,
                ReduceKind::Mean => {
                    spread.div(&x.ones_like()?.sum(&axes_isize(&spec.axes), true)?)?
                }
                ReduceKind::Max | ReduceKind::Min => {
                    let (mask, count) = extremum_mask(x, node, spec)?;
                    spread.mul(&mask)?.div(&count)?
                }
            };
            first(grad)
        }
        Operation::Reshape(_)
        | Operation::ReshapeLike
        | Operation::ExpandDims(_)
        | Operation::Squeeze(_)
        | Operation::Unflatten(_) => first(g.reshape_like(&inputs[0])?),
        Operation::Transpose(spec) => {
            let mut inverse = vec![0usize; spec.perm.len()];
            for (axis, &source) in spec.perm.iter().enumerate() {
                inverse[source] = axis;
            }
            first(g.transpose(&inverse)?)
        }
        Operation::BroadcastTo(_) | Operation::BroadcastLike => first(g.sum_to_like(&inputs[0])?),
        Operation::ReduceToLike => first(g.broadcast_like(&inputs[0])?),
        Operation::Matmul => {
            let (a, b) = (&inputs[0], &inputs[1]);
            vec![
                Some(g.matmul(&b.matrix_transpose()?)?.sum_to_like(a)?),
                Some(a.matrix_transpose()?.matmul(g)?.sum_to_like(b)?),
            ]
        }
        Operation::Take(spec) => first(Array::from_node(
            Operation::ScatterSlice(spec.clone()),
            vec![g.clone(), inputs[0].clone()],
        )?),
        Operation::ScatterSlice(spec) => first(g.take(spec.axis as isize, spec.index)?),
        Operation::Stack(spec) => (0..arity)
            .map(|idx| g.take(spec.axis as isize, idx as isize).map(Some))
            .collect::<Result<Vec<_>>>()?,
        Operation::Fused(spec) => {
            let output = expand_fused(spec, inputs)?;
            let grads = backward(&[output], &[g.clone()], inputs)?;
            // Repeated operands share one total; hand it to the first position only.
            let mut seen: HashSet<ArrayId> = HashSet::new();
            inputs
                .iter()
                .zip(grads)
                .map(|(input, grad)| seen.insert(input.id()).then_some(grad))
                .collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_through_shared_operand_accumulates() -> Result<()> {
        let x = Array::from_f32(&[3.0], &[])?;
        let y = x.mul(&x)?;
        let grads = backward(&[y.clone()], &[y.ones_like()?], &[x.clone()])?;
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].op().map(|op| op.label().into_owned()).as_deref(), Some("Add"));
        assert_eq!(grads[0].shape(), x.shape());
        Ok(())
    }

    #[test]
    fn unrelated_primals_receive_zeros() -> Result<()> {
        let x = Array::from_f32(&[1.0, 2.0], &[2])?;
        let unused = Array::from_f32(&[5.0, 5.0], &[2])?;
        let y = x.sum(&[], false)?;
        let grads = backward(&[y.clone()], &[y.ones_like()?], &[x, unused])?;
        assert_eq!(grads[0].op().map(|op| op.label().into_owned()).as_deref(), Some("Broadcast"));
        assert_eq!(grads[1].op().map(|op| op.label().into_owned()).as_deref(), Some("Full"));
        assert_eq!(grads[1].shape(), &[2]);
        Ok(())
    }
}
