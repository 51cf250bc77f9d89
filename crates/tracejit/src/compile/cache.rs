//! Compiled-graph cache partitioned per function.
//!
//! Partitions are owned by the compiled wrappers of a function; the global
//! registry only holds weak references, so dropping the last wrapper frees
//! every graph traced for that function.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use lru::LruCache;
use once_cell::sync::{Lazy, OnceCell};

use crate::compile::function::FunctionId;
use crate::compile::graph::CompiledGraph;
use crate::compile::signature::Signature;
use crate::env;
use crate::profiling;

type Slot = Arc<OnceCell<Arc<CompiledGraph>>>;

static REGISTRY: Lazy<Mutex<HashMap<FunctionId, Weak<Partition>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static LIVE_PARTITIONS: AtomicUsize = AtomicUsize::new(0);

fn registry() -> MutexGuard<'static, HashMap<FunctionId, Weak<Partition>>> {
    REGISTRY.lock().expect("compile cache registry poisoned")
}

/// Per-function counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Traces that ran to completion.
    pub traces: usize,
    /// Calls served by an existing graph (including waits on an in-flight trace).
    pub hits: usize,
    /// Graphs currently retained.
    pub entries: usize,
}

/// All compiled graphs of one function, bounded by LRU capacity.
pub struct Partition {
    function: FunctionId,
    entries: Mutex<LruCache<Signature, Slot>>,
    traces: AtomicUsize,
    hits: AtomicUsize,
}

impl Partition {
    fn new(function: FunctionId) -> Self {
        let capacity = NonZeroUsize::new(env::cache_capacity()).unwrap_or(NonZeroUsize::MIN);
        LIVE_PARTITIONS.fetch_add(1, Ordering::SeqCst);
        Self {
            function,
            entries: Mutex::new(LruCache::new(capacity)),
            traces: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<Signature, Slot>> {
        self.entries.lock().expect("compile cache partition poisoned")
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            traces: self.traces.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            entries: self.entries().len(),
        }
    }

    /// Returns the slot for `signature`, creating an empty one on a miss.
    fn slot(&self, signature: &Signature) -> Slot {
        let mut entries = self.entries();
        if let Some(slot) = entries.get(signature) {
            return Arc::clone(slot);
        }
        let reason = entries
            .iter()
            .next()
            .map(|(recent, _)| signature.diff(recent))
            .unwrap_or("first call");
        log::debug!("compile cache miss for {} ({reason})", self.function);
        let slot: Slot = Arc::new(OnceCell::new());
        if let Some((evicted, _)) = entries.push(signature.clone(), Arc::clone(&slot)) {
            if &evicted != signature {
                profiling::cache_event("compile_cache_evict");
                log::debug!("evicted least recently used graph of {}", self.function);
            }
        }
        slot
    }

    /// Returns the graph for `signature`, running `trace` at most once per
    /// signature. Concurrent callers for the same signature block until the
    /// in-flight trace finishes. A failed trace leaves no entry behind.
    pub(crate) fn get_or_trace<F>(
        &self,
        signature: &Signature,
        trace: F,
    ) -> Result<Arc<CompiledGraph>>
    where
        F: FnOnce() -> Result<CompiledGraph>,
    {
        let slot = self.slot(signature);
        if let Some(graph) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("compile_cache_hit");
            return Ok(Arc::clone(graph));
        }

        let mut traced = false;
        let result = slot.get_or_try_init(|| {
            traced = true;
            profiling::cache_event("compile_cache_miss");
            trace().map(Arc::new)
        });
        match result {
            Ok(graph) => {
                if traced {
                    self.traces.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    profiling::cache_event("compile_trace_wait");
                }
                Ok(Arc::clone(graph))
            }
            Err(err) => {
                let mut entries = self.entries();
                if entries
                    .peek(signature)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    entries.pop(signature);
                }
                Err(err)
            }
        }
    }

    fn lookup(&self, signature: &Signature) -> Option<Arc<CompiledGraph>> {
        self.entries()
            .get(signature)
            .and_then(|slot| slot.get().cloned())
    }

    fn insert(&self, signature: Signature, graph: Arc<CompiledGraph>) {
        let slot: Slot = Arc::new(OnceCell::with_value(graph));
        self.entries().put(signature, slot);
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        LIVE_PARTITIONS.fetch_sub(1, Ordering::SeqCst);
        let mut registry = registry();
        let dead = registry
            .get(&self.function)
            .is_some_and(|weak| weak.strong_count() == 0);
        if dead {
            registry.remove(&self.function);
        }
        log::debug!("released compile cache partition of {}", self.function);
    }
}

/// Returns the live partition of `function`, creating it if needed.
pub(crate) fn partition_for(function: FunctionId) -> Arc<Partition> {
    let mut registry = registry();
    if let Some(partition) = registry.get(&function).and_then(Weak::upgrade) {
        return partition;
    }
    let partition = Arc::new(Partition::new(function));
    registry.insert(function, Arc::downgrade(&partition));
    partition
}

fn live_partition(function: FunctionId) -> Option<Arc<Partition>> {
    registry().get(&function).and_then(Weak::upgrade)
}

/// Cached graph of `function` for `signature`, if its partition is alive.
pub fn lookup(function: FunctionId, signature: &Signature) -> Option<Arc<CompiledGraph>> {
    live_partition(function)?.lookup(signature)
}

/// Stores `graph`; returns `false` when no compiled wrapper of `function` is alive.
pub fn insert(function: FunctionId, signature: Signature, graph: Arc<CompiledGraph>) -> bool {
    match live_partition(function) {
        Some(partition) => {
            partition.insert(signature, graph);
            true
        }
        None => false,
    }
}

/// Number of partitions (functions with at least one live compiled wrapper).
pub fn live_partitions() -> usize {
    LIVE_PARTITIONS.load(Ordering::SeqCst)
}

pub use crate::compile::graph::live_graphs;
