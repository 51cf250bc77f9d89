//! Evaluation barrier: materializes lazy arrays through the default backend.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};

use crate::backend::registry;
use crate::backend::spec::TensorLiteral;
use crate::error::CompileError;
use crate::tensor::array::{Array, ArrayId, Source};

/// Post-order list of every unevaluated node reachable from `roots`.
///
/// Fails with [`CompileError::EvalDuringTrace`] when a placeholder is reached,
/// since placeholders carry no data outside the graph that owns them.
fn pending_nodes(roots: &[&Array]) -> Result<Vec<Array>> {
    let mut order = Vec::new();
    let mut visited: HashSet<ArrayId> = HashSet::new();
    let mut stack: Vec<(Array, bool)> = roots.iter().map(|a| ((*a).clone(), false)).collect();
    stack.reverse();

    while let Some((array, expanded)) = stack.pop() {
        if array.is_evaluated() {
            continue;
        }
        if expanded {
            order.push(array);
            continue;
        }
        if !visited.insert(array.id()) {
            continue;
        }
        match array.source() {
            Source::Data => {}
            Source::Placeholder { .. } => return Err(CompileError::EvalDuringTrace.into()),
            Source::Node { inputs, .. } => {
                let children: Vec<Array> = inputs
                    .iter()
                    .rev()
                    .filter(|input| !input.is_evaluated() && !visited.contains(&input.id()))
                    .cloned()
                    .collect();
                stack.push((array, true));
                stack.extend(children.into_iter().map(|child| (child, false)));
            }
        }
    }
    Ok(order)
}

/// Forces evaluation of `arrays`. Intermediate values are dropped once every
/// requested array holds its data.
pub fn eval(arrays: &[&Array]) -> Result<()> {
    let order = pending_nodes(arrays)?;
    if order.is_empty() {
        return Ok(());
    }
    let backend = registry::default_backend()?;
    let requested: HashSet<ArrayId> = arrays.iter().map(|a| a.id()).collect();
    log::trace!(
        "evaluating {} node(s) on backend '{}'",
        order.len(),
        backend.backend_name()
    );

    let mut values: HashMap<ArrayId, TensorLiteral> = HashMap::with_capacity(order.len());
    for node in &order {
        let Source::Node { op, inputs } = node.source() else {
            continue;
        };
        let mut operands = Vec::with_capacity(inputs.len());
        for input in inputs {
            let literal = match input.cached_data() {
                Some(literal) => literal.clone(),
                None => values
                    .get(&input.id())
                    .cloned()
                    .ok_or_else(|| anyhow!("operand {:?} was not materialized", input.id()))?,
            };
            operands.push(literal);
        }
        let result = backend
            .execute(op, &operands, node.spec())
            .with_context(|| format!("while evaluating {}", op.label()))?;
        if requested.contains(&node.id()) {
            node.store_data(result.clone());
        }
        values.insert(node.id(), result);
    }
    Ok(())
}

/// Evaluates a slice of owned arrays.
pub fn eval_all(arrays: &[Array]) -> Result<()> {
    let refs: Vec<&Array> = arrays.iter().collect();
    eval(&refs)
}
