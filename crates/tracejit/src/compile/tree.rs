//! Structured arguments: ordered trees of array, constant and opaque leaves.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::error::CompileError;
use crate::tensor::Array;

/// Equality-comparable scalar leaf. Containers of constants are expressed as
/// ordinary tree containers.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            // Bitwise so that NaN constants still hit the cache.
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            // Same allocation means the value was already checked on an earlier call.
            (Constant::Str(a), Constant::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Constant::None => {}
            Constant::Bool(v) => v.hash(state),
            Constant::Int(v) => v.hash(state),
            Constant::Float(v) => v.to_bits().hash(state),
            Constant::Str(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Bool(v) => write!(f, "{v}"),
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Float(v) => write!(f, "{v}"),
            Constant::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// A value with no structural equality contract. Accepted by plain function
/// calls, rejected by compile signatures.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

#[derive(Debug, Clone)]
pub enum Leaf {
    Array(Array),
    Constant(Constant),
    Opaque(Opaque),
}

#[derive(Debug, Clone)]
pub enum Tree {
    Leaf(Leaf),
    List(Vec<Tree>),
    Tuple(Vec<Tree>),
    /// Key-ordered mapping.
    Dict(BTreeMap<String, Tree>),
}

/// Shape of a tree with its leaves removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TreeDef {
    Leaf,
    List(Vec<TreeDef>),
    Tuple(Vec<TreeDef>),
    Dict(Vec<(String, TreeDef)>),
}

impl TreeDef {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::List(items) | TreeDef::Tuple(items) => {
                items.iter().map(TreeDef::num_leaves).sum()
            }
            TreeDef::Dict(entries) => entries.iter().map(|(_, def)| def.num_leaves()).sum(),
        }
    }
}

/// One step of a path from a tree root to a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

pub type TreePath = Vec<PathSegment>;

pub fn format_path(root: &str, path: &[PathSegment]) -> String {
    let mut out = root.to_string();
    for segment in path {
        match segment {
            PathSegment::Index(idx) => out.push_str(&format!("[{idx}]")),
            PathSegment::Key(key) => out.push_str(&format!("[{key:?}]")),
        }
    }
    out
}

impl Tree {
    pub fn none() -> Self {
        Tree::Leaf(Leaf::Constant(Constant::None))
    }

    pub fn list(items: impl IntoIterator<Item = Tree>) -> Self {
        Tree::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = Tree>) -> Self {
        Tree::Tuple(items.into_iter().collect())
    }

    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Tree)>) -> Self {
        Tree::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Tree::Leaf(Leaf::Opaque(Opaque::new(value)))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf(_))
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Tree::Leaf(Leaf::Array(array)) => Some(array),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Tree::Leaf(Leaf::Constant(constant)) => Some(constant),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Tree::Leaf(Leaf::Opaque(opaque)) => Some(opaque),
            _ => None,
        }
    }

    /// Returns the array leaf or an `InvalidArgument` error.
    pub fn array(&self) -> Result<&Array> {
        self.as_array().ok_or_else(|| {
            CompileError::invalid(format!("expected an array leaf, found {}", self.kind())).into()
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.as_constant()? {
            Constant::Int(v) => Some(*v as f64),
            Constant::Float(v) => Some(*v),
            Constant::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_constant()? {
            Constant::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.as_constant()? {
            Constant::Str(v) => Some(v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Tree::Leaf(Leaf::Array(_)) => "array",
            Tree::Leaf(Leaf::Constant(_)) => "constant",
            Tree::Leaf(Leaf::Opaque(_)) => "opaque value",
            Tree::List(_) => "list",
            Tree::Tuple(_) => "tuple",
            Tree::Dict(_) => "dict",
        }
    }

    /// Positional child of a list or tuple.
    pub fn index(&self, idx: usize) -> Result<&Tree> {
        match self {
            Tree::List(items) | Tree::Tuple(items) => items.get(idx).ok_or_else(|| {
                CompileError::invalid(format!(
                    "index {idx} out of range for {} of length {}",
                    self.kind(),
                    items.len()
                ))
                .into()
            }),
            _ => Err(CompileError::invalid(format!("cannot index into a {}", self.kind())).into()),
        }
    }

    /// Keyed child of a dict.
    pub fn get(&self, key: &str) -> Result<&Tree> {
        match self {
            Tree::Dict(entries) => entries
                .get(key)
                .ok_or_else(|| CompileError::invalid(format!("missing key {key:?}")).into()),
            _ => Err(
                CompileError::invalid(format!("cannot look up {key:?} in a {}", self.kind()))
                    .into(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::List(items) | Tree::Tuple(items) => items.len(),
            Tree::Dict(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaves in traversal order (sequence order, then key order) and the
    /// structure that [`Tree::unflatten`] needs to rebuild the tree.
    pub fn flatten(&self) -> (Vec<Leaf>, TreeDef) {
        let mut leaves = Vec::new();
        let def = self.flatten_into(&mut leaves);
        (leaves, def)
    }

    fn flatten_into(&self, leaves: &mut Vec<Leaf>) -> TreeDef {
        match self {
            Tree::Leaf(leaf) => {
                leaves.push(leaf.clone());
                TreeDef::Leaf
            }
            Tree::List(items) => {
                TreeDef::List(items.iter().map(|t| t.flatten_into(leaves)).collect())
            }
            Tree::Tuple(items) => {
                TreeDef::Tuple(items.iter().map(|t| t.flatten_into(leaves)).collect())
            }
            Tree::Dict(entries) => TreeDef::Dict(
                entries
                    .iter()
                    .map(|(k, t)| (k.clone(), t.flatten_into(leaves)))
                    .collect(),
            ),
        }
    }

    /// Leaves paired with their path from the root, in flatten order.
    pub fn leaves_with_paths(&self) -> Vec<(TreePath, &Leaf)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_paths(&mut path, &mut out);
        out
    }

    fn collect_paths<'a>(&'a self, path: &mut TreePath, out: &mut Vec<(TreePath, &'a Leaf)>) {
        match self {
            Tree::Leaf(leaf) => out.push((path.clone(), leaf)),
            Tree::List(items) | Tree::Tuple(items) => {
                for (idx, item) in items.iter().enumerate() {
                    path.push(PathSegment::Index(idx));
                    item.collect_paths(path, out);
                    path.pop();
                }
            }
            Tree::Dict(entries) => {
                for (key, item) in entries {
                    path.push(PathSegment::Key(key.clone()));
                    item.collect_paths(path, out);
                    path.pop();
                }
            }
        }
    }

    pub fn unflatten(def: &TreeDef, leaves: Vec<Leaf>) -> Result<Tree> {
        let expected = def.num_leaves();
        if leaves.len() != expected {
            return Err(CompileError::invalid(format!(
                "tree expects {expected} leaves, got {}",
                leaves.len()
            ))
            .into());
        }
        let mut iter = leaves.into_iter();
        Self::build(def, &mut iter)
    }

    fn build(def: &TreeDef, leaves: &mut std::vec::IntoIter<Leaf>) -> Result<Tree> {
        Ok(match def {
            TreeDef::Leaf => Tree::Leaf(
                leaves
                    .next()
                    .ok_or_else(|| CompileError::invalid("ran out of leaves"))?,
            ),
            TreeDef::List(items) => Tree::List(
                items
                    .iter()
                    .map(|d| Self::build(d, leaves))
                    .collect::<Result<_>>()?,
            ),
            TreeDef::Tuple(items) => Tree::Tuple(
                items
                    .iter()
                    .map(|d| Self::build(d, leaves))
                    .collect::<Result<_>>()?,
            ),
            TreeDef::Dict(entries) => Tree::Dict(
                entries
                    .iter()
                    .map(|(k, d)| Ok((k.clone(), Self::build(d, leaves)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Array leaves in flatten order.
    pub fn arrays(&self) -> Vec<Array> {
        self.flatten()
            .0
            .into_iter()
            .filter_map(|leaf| match leaf {
                Leaf::Array(array) => Some(array),
                _ => None,
            })
            .collect()
    }

    /// Rebuilds the tree with every array leaf replaced by `f(array)`.
    pub fn map_arrays<F>(&self, mut f: F) -> Result<Tree>
    where
        F: FnMut(&Array) -> Result<Array>,
    {
        let (leaves, def) = self.flatten();
        let mapped = leaves
            .into_iter()
            .map(|leaf| match leaf {
                Leaf::Array(array) => Ok(Leaf::Array(f(&array)?)),
                other => Ok(other),
            })
            .collect::<Result<Vec<_>>>()?;
        Tree::unflatten(&def, mapped)
    }

    /// Mutable child at `path`, creating missing dict keys along the way.
    /// A list index equal to the length appends.
    pub fn set_path(&mut self, path: &[PathSegment], value: Tree) -> Result<()> {
        let Some((head, rest)) = path.split_first() else {
            *self = value;
            return Ok(());
        };
        let child = match (self, head) {
            (Tree::List(items), PathSegment::Index(idx))
            | (Tree::Tuple(items), PathSegment::Index(idx)) => {
                if *idx == items.len() {
                    items.push(Tree::none());
                }
                items.get_mut(*idx).ok_or_else(|| {
                    CompileError::invalid(format!("index {idx} out of range while writing state"))
                })?
            }
            (Tree::Dict(entries), PathSegment::Key(key)) => {
                entries.entry(key.clone()).or_insert_with(Tree::none)
            }
            (tree, segment) => {
                return Err(CompileError::invalid(format!(
                    "cannot follow {segment:?} into a {}",
                    tree.kind()
                ))
                .into())
            }
        };
        child.set_path(rest, value)
    }

    pub fn get_path(&self, path: &[PathSegment]) -> Option<&Tree> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match (self, head) {
            (Tree::List(items), PathSegment::Index(idx))
            | (Tree::Tuple(items), PathSegment::Index(idx)) => {
                items.get(*idx)?
            }
            (Tree::Dict(entries), PathSegment::Key(key)) => entries.get(key)?,
            _ => return None,
        };
        child.get_path(rest)
    }
}

impl From<Array> for Tree {
    fn from(array: Array) -> Self {
        Tree::Leaf(Leaf::Array(array))
    }
}

impl From<&Array> for Tree {
    fn from(array: &Array) -> Self {
        Tree::Leaf(Leaf::Array(array.clone()))
    }
}

impl From<Constant> for Tree {
    fn from(constant: Constant) -> Self {
        Tree::Leaf(Leaf::Constant(constant))
    }
}

impl From<Leaf> for Tree {
    fn from(leaf: Leaf) -> Self {
        Tree::Leaf(leaf)
    }
}

impl From<bool> for Tree {
    fn from(value: bool) -> Self {
        Constant::Bool(value).into()
    }
}

impl From<i64> for Tree {
    fn from(value: i64) -> Self {
        Constant::Int(value).into()
    }
}

impl From<i32> for Tree {
    fn from(value: i32) -> Self {
        Constant::Int(i64::from(value)).into()
    }
}

impl From<f64> for Tree {
    fn from(value: f64) -> Self {
        Constant::Float(value).into()
    }
}

impl From<&str> for Tree {
    fn from(value: &str) -> Self {
        Constant::Str(Arc::from(value)).into()
    }
}

impl From<String> for Tree {
    fn from(value: String) -> Self {
        Constant::Str(Arc::from(value)).into()
    }
}

impl From<Arc<str>> for Tree {
    fn from(value: Arc<str>) -> Self {
        Constant::Str(value).into()
    }
}

impl From<Vec<Tree>> for Tree {
    fn from(items: Vec<Tree>) -> Self {
        Tree::List(items)
    }
}

impl From<Vec<Array>> for Tree {
    fn from(items: Vec<Array>) -> Self {
        Tree::List(items.into_iter().map(Tree::from).collect())
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Tree>,
    pub keyword: BTreeMap<String, Tree>,
}

impl Args {
    pub fn new(positional: Vec<Tree>) -> Self {
        Self {
            positional,
            keyword: BTreeMap::new(),
        }
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Tree>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn arg(&self, idx: usize) -> Result<&Tree> {
        self.positional.get(idx).ok_or_else(|| {
            CompileError::invalid(format!(
                "missing positional argument {idx} (got {})",
                self.positional.len()
            ))
            .into()
        })
    }

    pub fn array(&self, idx: usize) -> Result<&Array> {
        self.arg(idx)?.array()
    }

    pub fn get(&self, key: &str) -> Result<&Tree> {
        self.keyword
            .get(key)
            .ok_or_else(|| {
                CompileError::invalid(format!("missing keyword argument {key:?}")).into()
            })
    }

    /// Positional argument `idx`, falling back to keyword `key`.
    pub fn arg_or_kwarg(&self, idx: usize, key: &str) -> Result<&Tree> {
        match self.positional.get(idx) {
            Some(tree) => Ok(tree),
            None => self.get(key),
        }
    }

    /// `((positional...), {keyword...})`
    pub fn to_tree(&self) -> Tree {
        Tree::Tuple(vec![
            Tree::Tuple(self.positional.clone()),
            Tree::Dict(self.keyword.clone()),
        ])
    }

    pub fn from_tree(tree: Tree) -> Result<Self> {
        match tree {
            Tree::Tuple(mut parts) if parts.len() == 2 => {
                let keyword = parts.pop();
                let positional = parts.pop();
                match (positional, keyword) {
                    (Some(Tree::Tuple(positional)), Some(Tree::Dict(keyword))) => {
                        Ok(Self { positional, keyword })
                    }
                    _ => Err(CompileError::invalid("malformed argument tree").into()),
                }
            }
            _ => Err(CompileError::invalid("malformed argument tree").into()),
        }
    }
}

impl From<Vec<Tree>> for Args {
    fn from(positional: Vec<Tree>) -> Self {
        Args::new(positional)
    }
}

/// Builds [`Args`] from positional values convertible into [`Tree`].
#[macro_export]
macro_rules! args {
    () => {
        $crate::compile::Args::default()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::compile::Args::new(vec![$($crate::compile::Tree::from($value)),+])
    };
}
