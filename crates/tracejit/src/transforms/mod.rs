//! Function transforms over lazy arrays: reverse mode ([`vjp`], [`grad`]),
//! forward mode ([`jvp`]) and batching ([`vmap`]).
//!
//! Transforms walk the recorded node graph of the arrays a function returns,
//! so they compose with compiled functions: a compiled call binds its cached
//! graph to ordinary nodes, and fused nodes are expanded on the fly.

mod jvp;
mod vjp;
mod vmap;

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::backend::fusion::{FusedSpec, FusionRef};
use crate::compile::{Args, Function, Tree};
use crate::error::CompileError;
use crate::tensor::{Array, ArrayId};

pub use jvp::jvp;
pub use vjp::vjp;
pub use vmap::vmap;

/// Nodes between `stops` and `outputs` that depend on at least one stop, in
/// post-order (inputs before users). Stops themselves are not listed.
pub(crate) fn dependent_nodes(outputs: &[Array], stops: &HashSet<ArrayId>) -> Vec<Array> {
    let mut order = Vec::new();
    let mut depends: HashMap<ArrayId, bool> = HashMap::new();
    let mut visiting: HashSet<ArrayId> = HashSet::new();
    let mut stack: Vec<(Array, bool)> = outputs.iter().rev().map(|a| (a.clone(), false)).collect();

    while let Some((array, expanded)) = stack.pop() {
        let id = array.id();
        if expanded {
            let dep = array
                .inputs()
                .iter()
                .any(|input| depends.get(&input.id()).copied().unwrap_or(false));
            depends.insert(id, dep);
            if dep {
                order.push(array);
            }
            continue;
        }
        if depends.contains_key(&id) || !visiting.insert(id) {
            continue;
        }
        if stops.contains(&id) {
            depends.insert(id, true);
            continue;
        }
        if array.inputs().is_empty() {
            depends.insert(id, false);
            continue;
        }
        let children: Vec<Array> = array
            .inputs()
            .iter()
            .rev()
            .filter(|input| !depends.contains_key(&input.id()))
            .cloned()
            .collect();
        stack.push((array, true));
        stack.extend(children.into_iter().map(|child| (child, false)));
    }
    order
}

/// Rebuilds a fused node as the chain of ordinary nodes it stands for.
pub(crate) fn expand_fused(spec: &FusedSpec, inputs: &[Array]) -> Result<Array> {
    let mut nodes: Vec<Array> = Vec::with_capacity(spec.nodes.len());
    for node in &spec.nodes {
        let args = node
            .args
            .iter()
            .map(|arg| {
                match *arg {
                    FusionRef::Input(idx) => inputs.get(idx),
                    FusionRef::Node(idx) => nodes.get(idx),
                }
                .cloned()
                .ok_or_else(|| CompileError::shape(&spec.label, "dangling fused reference"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        nodes.push(Array::from_node(node.op.to_operation(), args)?);
    }
    nodes
        .pop()
        .ok_or_else(|| CompileError::shape(&spec.label, "fused unit has no nodes").into())
}

pub(crate) fn axes_isize(axes: &[usize]) -> Vec<isize> {
    axes.iter().map(|&axis| axis as isize).collect()
}

/// Loss value, per-argument gradient trees.
fn value_and_grads(
    function: &Function,
    args: &Args,
    argnums: &[usize],
) -> Result<(Tree, Vec<Tree>)> {
    let mut primals = Vec::new();
    for &argnum in argnums {
        primals.extend(args.arg(argnum)?.arrays());
    }
    let value = function.call(args)?;
    let loss = value.arrays().into_iter().next().ok_or_else(|| {
        CompileError::invalid(format!("{} returned no array to differentiate", function.name()))
    })?;
    if loss.size() != 1 {
        return Err(CompileError::invalid(format!(
            "gradient requires a scalar output, got shape {:?}",
            loss.shape()
        ))
        .into());
    }
    let cotangent = loss.ones_like()?;
    let grads = vjp::backward(&[loss], &[cotangent], &primals)?;

    let mut grads = grads.into_iter();
    let mut trees = Vec::with_capacity(argnums.len());
    for &argnum in argnums {
        trees.push(args.arg(argnum)?.map_arrays(|_| {
            grads
                .next()
                .ok_or_else(|| CompileError::invalid("gradient count mismatch").into())
        })?);
    }
    Ok((value, trees))
}

/// Gradient of the first array output with respect to every array leaf of
/// positional argument 0. The result has the structure of that argument.
pub fn grad(function: &Function) -> Function {
    let f = function.clone();
    Function::named(format!("grad({})", function.name()), move |args| {
        let (_, mut grads) = value_and_grads(&f, args, &[0])?;
        Ok(grads.remove(0))
    })
}

/// Gradients with respect to several positional arguments, as a tuple.
pub fn grad_argnums(function: &Function, argnums: &[usize]) -> Function {
    let f = function.clone();
    let argnums = argnums.to_vec();
    Function::named(format!("grad({})", function.name()), move |args| {
        let (_, grads) = value_and_grads(&f, args, &argnums)?;
        Ok(Tree::tuple(grads))
    })
}

/// `(value, grad)` where `grad` is what [`grad`] would return.
pub fn value_and_grad(function: &Function) -> Function {
    let f = function.clone();
    Function::named(format!("value_and_grad({})", function.name()), move |args| {
        let (value, mut grads) = value_and_grads(&f, args, &[0])?;
        Ok(Tree::tuple([value, grads.remove(0)]))
    })
}
