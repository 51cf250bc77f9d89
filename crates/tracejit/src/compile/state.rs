//! Externally owned mutable containers threaded through compiled calls.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::compile::tree::{Leaf, PathSegment, Tree, TreePath};
use crate::error::CompileError;
use crate::tensor::Array;

/// Shared handle to a mutable tree (typically a dict or list of arrays).
///
/// Clones alias the same container. A compiled function declared with a
/// state as input reads its current leaves on every call; declared as
/// output, leaves written during the trace are written back after each call.
#[derive(Clone)]
pub struct State(Arc<Mutex<Tree>>);

impl State {
    pub fn new(tree: Tree) -> Self {
        State(Arc::new(Mutex::new(tree)))
    }

    /// Empty key-ordered mapping.
    pub fn map() -> Self {
        Self::new(Tree::Dict(Default::default()))
    }

    pub fn list(items: impl IntoIterator<Item = Tree>) -> Self {
        Self::new(Tree::list(items))
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.0.lock().expect("state container poisoned")
    }

    pub fn ptr_eq(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copy of the current contents; leaves are shared handles.
    pub fn snapshot(&self) -> Tree {
        self.lock().clone()
    }

    pub fn replace(&self, tree: Tree) -> Tree {
        std::mem::replace(&mut *self.lock(), tree)
    }

    pub fn get(&self, key: &str) -> Result<Tree> {
        Ok(self.lock().get(key)?.clone())
    }

    pub fn get_or(&self, key: &str, default: impl Into<Tree>) -> Tree {
        self.lock().get(key).map(Tree::clone).unwrap_or_else(|_| default.into())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().get(key).is_ok()
    }

    pub fn index(&self, idx: usize) -> Result<Tree> {
        Ok(self.lock().index(idx)?.clone())
    }

    pub fn array(&self, key: &str) -> Result<Array> {
        Ok(self.lock().get(key)?.array()?.clone())
    }

    pub fn array_at(&self, idx: usize) -> Result<Array> {
        Ok(self.lock().index(idx)?.array()?.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Tree>) -> Result<()> {
        self.lock()
            .set_path(&[PathSegment::Key(key.into())], value.into())
    }

    pub fn set_index(&self, idx: usize, value: impl Into<Tree>) -> Result<()> {
        self.lock().set_path(&[PathSegment::Index(idx)], value.into())
    }

    pub fn set_path(&self, path: &[PathSegment], value: impl Into<Tree>) -> Result<()> {
        self.lock().set_path(path, value.into())
    }

    pub fn push(&self, value: impl Into<Tree>) -> Result<()> {
        let mut tree = self.lock();
        match &mut *tree {
            Tree::List(items) => {
                items.push(value.into());
                Ok(())
            }
            _ => Err(CompileError::invalid("push requires a list state").into()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn leaves_with_paths(&self) -> Vec<(TreePath, Leaf)> {
        self.lock()
            .leaves_with_paths()
            .into_iter()
            .map(|(path, leaf)| (path, leaf.clone()))
            .collect()
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("State").field(&*self.lock()).finish()
    }
}

/// Restores a set of states to their snapshots when dropped.
pub(crate) struct StateRestore {
    saved: Vec<(State, Tree)>,
}

impl StateRestore {
    pub(crate) fn capture(states: &[&State]) -> Self {
        let mut saved: Vec<(State, Tree)> = Vec::new();
        for state in states {
            if saved.iter().any(|(seen, _)| seen.ptr_eq(state)) {
                continue;
            }
            saved.push(((*state).clone(), state.snapshot()));
        }
        Self { saved }
    }
}

impl Drop for StateRestore {
    fn drop(&mut self) {
        for (state, tree) in self.saved.drain(..) {
            state.replace(tree);
        }
    }
}
