//! Cache keys derived from call arguments and captured state.

use serde::Serialize;

use crate::backend::hashing::hash_serializable;
use crate::backend::spec::DType;
use crate::compile::function::FunctionId;
use crate::compile::state::State;
use crate::compile::tree::{format_path, Args, Constant, Leaf, PathSegment, TreeDef, TreePath};
use crate::error::CompileError;
use crate::tensor::{Array, ArrayId};

/// Per-array contribution to a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ArrayDescriptor {
    Exact { dtype: DType, dims: Vec<usize> },
    /// Shapeless mode keeps only dtype and rank.
    Rank { dtype: DType, rank: usize },
}

impl ArrayDescriptor {
    fn of(array: &Array, shapeless: bool) -> Self {
        if shapeless {
            ArrayDescriptor::Rank {
                dtype: array.dtype(),
                rank: array.ndim(),
            }
        } else {
            ArrayDescriptor::Exact {
                dtype: array.dtype(),
                dims: array.shape().to_vec(),
            }
        }
    }
}

/// Everything that decides whether a compiled graph can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub function: FunctionId,
    pub shapeless: bool,
    fingerprint: u64,
    structure: Vec<TreeDef>,
    arrays: Vec<ArrayDescriptor>,
    constants: Vec<Constant>,
    state_ids: Vec<ArrayId>,
}

impl Signature {
    /// Stable FNV fingerprint of the argument and state structure.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn array_descriptors(&self) -> &[ArrayDescriptor] {
        &self.arrays
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Same key with every argument array described by its exact shape, for
    /// shapeless graphs that turned out to depend on concrete extents.
    pub(crate) fn with_exact_extents(&self, leaves: &CallLeaves) -> Signature {
        let arrays = leaves
            .arg_leaves
            .iter()
            .filter_map(|leaf| match leaf {
                Leaf::Array(array) => Some(ArrayDescriptor::of(array, false)),
                _ => None,
            })
            .collect();
        Signature {
            arrays,
            ..self.clone()
        }
    }

    /// First component that differs from `other`, for miss diagnostics.
    pub fn diff(&self, other: &Signature) -> &'static str {
        if self.structure != other.structure {
            "argument structure"
        } else if self.arrays != other.arrays {
            "array dtype or shape"
        } else if self.constants != other.constants {
            "constant value"
        } else if self.state_ids != other.state_ids {
            "captured state"
        } else {
            "none"
        }
    }
}

/// Flattened view of one call, aligned with the signature's leaf order.
pub(crate) struct CallLeaves {
    pub arg_def: TreeDef,
    pub arg_leaves: Vec<Leaf>,
    /// One entry per declared input state, in declaration order.
    pub state_leaves: Vec<Vec<(TreePath, Leaf)>>,
}

impl CallLeaves {
    /// Array leaves of the arguments followed by those of each input state.
    pub fn input_arrays(&self) -> Vec<Array> {
        let args = self.arg_leaves.iter();
        let states = self.state_leaves.iter().flatten().map(|(_, leaf)| leaf);
        args.chain(states)
            .filter_map(|leaf| match leaf {
                Leaf::Array(array) => Some(array.clone()),
                _ => None,
            })
            .collect()
    }
}

fn describe_arg_path(path: &[PathSegment]) -> String {
    match path.split_first() {
        Some((PathSegment::Index(0), rest)) => format_path("args", rest),
        Some((PathSegment::Index(_), rest)) => format_path("kwargs", rest),
        _ => format_path("args", path),
    }
}

fn structure_fingerprint(structure: &[TreeDef]) -> Result<u64, CompileError> {
    hash_serializable(structure).map_err(|err| CompileError::Fingerprint(err.to_string()))
}

/// Builds the signature of a call.
pub(crate) fn extract(
    function: FunctionId,
    shapeless: bool,
    args: &Args,
    inputs: &[State],
) -> Result<(Signature, CallLeaves), CompileError> {
    let arg_tree = args.to_tree();
    let mut arrays = Vec::new();
    let mut constants = Vec::new();
    let mut arg_leaves = Vec::new();

    for (path, leaf) in arg_tree.leaves_with_paths() {
        match leaf {
            Leaf::Array(array) => arrays.push(ArrayDescriptor::of(array, shapeless)),
            Leaf::Constant(constant) => constants.push(constant.clone()),
            Leaf::Opaque(opaque) => {
                return Err(CompileError::UnsupportedArgument {
                    path: describe_arg_path(&path),
                    type_name: opaque.type_name().to_string(),
                })
            }
        }
        arg_leaves.push(leaf.clone());
    }
    let arg_def = arg_tree.flatten().1;

    let mut structure = vec![arg_def.clone()];
    let mut state_ids = Vec::new();
    let mut state_leaves = Vec::with_capacity(inputs.len());
    for (index, state) in inputs.iter().enumerate() {
        let snapshot = state.snapshot();
        structure.push(snapshot.flatten().1);
        let leaves = state.leaves_with_paths();
        for (path, leaf) in &leaves {
            match leaf {
                Leaf::Array(array) => state_ids.push(array.id()),
                Leaf::Constant(constant) => constants.push(constant.clone()),
                Leaf::Opaque(opaque) => {
                    return Err(CompileError::UnsupportedArgument {
                        path: format_path(&format!("inputs[{index}]"), path),
                        type_name: opaque.type_name().to_string(),
                    })
                }
            }
        }
        state_leaves.push(leaves);
    }

    let fingerprint = structure_fingerprint(&structure)?;
    let signature = Signature {
        function,
        shapeless,
        fingerprint,
        structure,
        arrays,
        constants,
        state_ids,
    };
    Ok((
        signature,
        CallLeaves {
            arg_def,
            arg_leaves,
            state_leaves,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::tree::Tree;

    fn id() -> FunctionId {
        FunctionId::next()
    }

    #[test]
    fn shapeless_signatures_ignore_extents() -> anyhow::Result<()> {
        let f = id();
        let small = Args::new(vec![Array::zeros(&[2], DType::F32)?.into()]);
        let large = Args::new(vec![Array::zeros(&[7], DType::F32)?.into()]);
        let (a, _) = extract(f, true, &small, &[])?;
        let (b, _) = extract(f, true, &large, &[])?;
        assert_eq!(a, b);
        let (c, _) = extract(f, false, &small, &[])?;
        let (d, _) = extract(f, false, &large, &[])?;
        assert_ne!(c, d);
        assert_eq!(c.diff(&d), "array dtype or shape");
        Ok(())
    }

    #[test]
    fn constants_and_keywords_are_part_of_the_key() -> anyhow::Result<()> {
        let f = id();
        let base = Args::new(vec![Tree::from(1.0)]).kwarg("mode", "fast");
        let other = Args::new(vec![Tree::from(2.0)]).kwarg("mode", "fast");
        let renamed = Args::new(vec![Tree::from(1.0)]).kwarg("kind", "fast");
        let (a, _) = extract(f, false, &base, &[])?;
        assert_ne!(a, extract(f, false, &other, &[])?.0);
        assert_ne!(a, extract(f, false, &renamed, &[])?.0);
        assert_eq!(a, extract(f, false, &base.clone(), &[])?.0);
        Ok(())
    }

    #[test]
    fn opaque_leaves_are_rejected_with_their_path() {
        struct Custom;
        let args = Args::new(vec![Tree::from(0.0)]).kwarg("y", Tree::opaque(Custom));
        let Err(err) = extract(id(), false, &args, &[]) else {
            panic!("opaque argument should not produce a signature");
        };
        match err {
            CompileError::UnsupportedArgument { path, type_name } => {
                assert_eq!(path, "kwargs[\"y\"]");
                assert!(type_name.ends_with("Custom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn replacing_a_state_leaf_changes_the_key() -> anyhow::Result<()> {
        let f = id();
        let state = State::map();
        state.set("y", Array::scalar_f32(2.0)?)?;
        let args = Args::default();
        let (a, leaves) = extract(f, false, &args, std::slice::from_ref(&state))?;
        assert_eq!(leaves.input_arrays().len(), 1);
        assert_eq!(a, extract(f, false, &args, std::slice::from_ref(&state))?.0);
        state.set("y", Array::scalar_f32(2.0)?)?;
        let (b, _) = extract(f, false, &args, std::slice::from_ref(&state))?;
        assert_eq!(a.diff(&b), "captured state");
        Ok(())
    }

    #[test]
    fn exact_extents_split_shapeless_keys() -> anyhow::Result<()> {
        let f = id();
        let small = Args::new(vec![Array::zeros(&[3, 2], DType::F32)?.into()]);
        let large = Args::new(vec![Array::zeros(&[5, 2], DType::F32)?.into()]);
        let (a, small_leaves) = extract(f, true, &small, &[])?;
        let (b, large_leaves) = extract(f, true, &large, &[])?;
        assert_eq!(a, b);
        let exact_small = a.with_exact_extents(&small_leaves);
        let exact_large = b.with_exact_extents(&large_leaves);
        assert_ne!(exact_small, exact_large);
        assert_ne!(exact_small, a);
        assert!(exact_small.shapeless);
        Ok(())
    }
}
