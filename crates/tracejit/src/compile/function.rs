use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::compile::tree::{Args, Tree};
use crate::tensor::Array;

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a user function; keys its cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl FunctionId {
    pub(crate) fn next() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

type Body = dyn Fn(&Args) -> Result<Tree> + Send + Sync;

/// A user function over structured arguments. Clones share identity, so a
/// compiled wrapper and the original agree on which cache partition to use.
#[derive(Clone)]
pub struct Function {
    id: FunctionId,
    name: Arc<str>,
    body: Arc<Body>,
}

impl Function {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&Args) -> Result<Tree> + Send + Sync + 'static,
    {
        Self::named("fn", body)
    }

    pub fn named<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Args) -> Result<Tree> + Send + Sync + 'static,
    {
        Self {
            id: FunctionId::next(),
            name: Arc::from(name.into()),
            body: Arc::new(body),
        }
    }

    /// Wraps a single-array function.
    pub fn unary<F>(f: F) -> Self
    where
        F: Fn(&Array) -> Result<Array> + Send + Sync + 'static,
    {
        Self::new(move |args| Ok(Tree::from(f(args.array(0)?)?)))
    }

    /// Wraps a two-array function.
    pub fn binary<F>(f: F) -> Self
    where
        F: Fn(&Array, &Array) -> Result<Array> + Send + Sync + 'static,
    {
        Self::new(move |args| Ok(Tree::from(f(args.array(0)?, args.array(1)?)?)))
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &Args) -> Result<Tree> {
        (self.body)(args)
    }

    /// Calls with arrays only and returns the array leaves of the result.
    pub fn call_arrays(&self, inputs: &[Array]) -> Result<Vec<Array>> {
        let args = Args::new(inputs.iter().map(Tree::from).collect());
        Ok(self.call(&args)?.arrays())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
