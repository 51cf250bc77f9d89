//! Runtime backend registry for dynamic backend selection.
//!
//! Kernel crates register a constructor under a name; the evaluation barrier
//! resolves the default backend lazily and keeps one shared instance.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{anyhow, Result};

use super::spec::PortableBackend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn PortableBackend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
    default_name: RwLock<Option<String>>,
    active: RwLock<Option<(String, Arc<dyn PortableBackend>)>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            default_name: RwLock::new(None),
            active: RwLock::new(None),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn PortableBackend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend by name with a constructor function.
///
/// The first registered backend becomes the default unless
/// [`set_default_backend`] picks another one.
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn PortableBackend> + Send + Sync + 'static,
{
    let name = name.into();
    let registry = global_registry();
    registry.register(name.clone(), Box::new(constructor));
    let mut default_name = registry
        .default_name
        .write()
        .expect("backend registry poisoned");
    if default_name.is_none() {
        *default_name = Some(name);
    }
}

/// Selects the backend used by the evaluation barrier.
pub fn set_default_backend(name: &str) -> Result<()> {
    let registry = global_registry();
    if !has_backend(name) {
        return Err(anyhow!("backend '{name}' is not registered"));
    }
    *registry
        .default_name
        .write()
        .expect("backend registry poisoned") = Some(name.to_string());
    Ok(())
}

/// Returns the shared instance of the default backend.
pub fn default_backend() -> Result<Arc<dyn PortableBackend>> {
    let registry = global_registry();
    let name = registry
        .default_name
        .read()
        .expect("backend registry poisoned")
        .clone()
        .ok_or_else(|| anyhow!("no backend registered; register a kernel provider first"))?;

    if let Some((active_name, backend)) = registry
        .active
        .read()
        .expect("backend registry poisoned")
        .as_ref()
    {
        if *active_name == name {
            return Ok(Arc::clone(backend));
        }
    }

    let backend = registry
        .create(&name)
        .ok_or_else(|| anyhow!("backend '{name}' is not registered"))?;
    *registry.active.write().expect("backend registry poisoned") =
        Some((name, Arc::clone(&backend)));
    Ok(backend)
}

pub fn list_backends() -> Vec<String> {
    let mut names: Vec<String> = global_registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

pub fn has_backend(name: &str) -> bool {
    global_registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .contains_key(name)
}
