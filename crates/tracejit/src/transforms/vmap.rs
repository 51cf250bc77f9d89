use anyhow::Result;

use crate::compile::{Args, Function, Leaf, Tree};
use crate::error::CompileError;
use crate::tensor::Array;

/// Maps `function` over a batch axis.
///
/// `in_axes[i]` names the batch axis of every array leaf of positional
/// argument `i`, or `None` to pass that argument unchanged to each slice.
/// Keyword arguments are never mapped. Array outputs are stacked along a new
/// leading axis; non-array output leaves are taken from the first slice.
pub fn vmap(function: &Function, in_axes: Vec<Option<usize>>) -> Function {
    let f = function.clone();
    Function::named(format!("vmap({})", function.name()), move |args| {
        if in_axes.len() != args.positional.len() {
            return Err(CompileError::invalid(format!(
                "vmap got {} in_axes for {} positional arguments",
                in_axes.len(),
                args.positional.len()
            ))
            .into());
        }
        let batch = batch_size(args, &in_axes)?;

        let mut results = Vec::with_capacity(batch);
        for idx in 0..batch {
            let positional = args
                .positional
                .iter()
                .zip(&in_axes)
                .map(|(tree, axis)| match axis {
                    Some(axis) => tree.map_arrays(|array| array.take(*axis as isize, idx as isize)),
                    None => Ok(tree.clone()),
                })
                .collect::<Result<Vec<_>>>()?;
            let slice = Args {
                positional,
                keyword: args.keyword.clone(),
            };
            results.push(f.call(&slice)?);
        }
        stack_results(results)
    })
}

fn batch_size(args: &Args, in_axes: &[Option<usize>]) -> Result<usize> {
    let mut batch: Option<usize> = None;
    for (tree, axis) in args.positional.iter().zip(in_axes) {
        let Some(axis) = *axis else {
            continue;
        };
        for array in tree.arrays() {
            let extent = *array.shape().get(axis).ok_or_else(|| {
                CompileError::invalid(format!(
                    "vmap axis {axis} out of range for shape {:?}",
                    array.shape()
                ))
            })?;
            match batch {
                None => batch = Some(extent),
                Some(existing) if existing != extent => {
                    return Err(CompileError::invalid(format!(
                        "vmap batch sizes disagree: {existing} vs {extent}"
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }
    }
    match batch {
        Some(batch) if batch > 0 => Ok(batch),
        Some(_) => Err(CompileError::invalid("vmap over an empty batch axis").into()),
        None => Err(CompileError::invalid("vmap needs at least one mapped array argument").into()),
    }
}

fn stack_results(results: Vec<Tree>) -> Result<Tree> {
    let mut flattened = results.iter().map(Tree::flatten);
    let Some((first, def)) = flattened.next() else {
        return Err(CompileError::invalid("vmap produced no results").into());
    };
    let mut columns: Vec<Vec<Leaf>> = first.into_iter().map(|leaf| vec![leaf]).collect();
    for (leaves, other) in flattened {
        if other != def {
            return Err(CompileError::invalid("vmap slices returned different structures").into());
        }
        for (column, leaf) in columns.iter_mut().zip(leaves) {
            column.push(leaf);
        }
    }

    let stacked = columns
        .into_iter()
        .map(|column| -> Result<Leaf> {
            if !matches!(column.first(), Some(Leaf::Array(_))) {
                return column
                    .into_iter()
                    .next()
                    .ok_or_else(|| CompileError::invalid("empty vmap column").into());
            }
            let arrays = column
                .into_iter()
                .map(|leaf| match leaf {
                    Leaf::Array(array) => Ok(array),
                    _ => Err(CompileError::invalid(
                        "vmap output leaf changed kind between slices",
                    )
                    .into()),
                })
                .collect::<Result<Vec<Array>>>()?;
            Ok(Leaf::Array(Array::stack(&arrays, 0)?))
        })
        .collect::<Result<Vec<_>>>()?;
    Tree::unflatten(&def, stacked)
}
