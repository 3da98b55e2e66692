//! Runtime backend registry for selecting native backends by name.
//!
//! Backend crates register a constructor under a name (the reference CPU backend registers
//! `"cpu"`); contexts then create backends without naming concrete types.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::backend::NativeBackend;

/// Factory that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn NativeBackend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        self.backends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn NativeBackend>> {
        let registry = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend by name. Registering an existing name replaces its constructor.
///
/// # Example
/// ```ignore
/// use webnn_rs::registry::register_backend;
///
/// pub fn register() {
///     register_backend("my_backend", || Arc::new(MyBackend::new()));
/// }
/// ```
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn NativeBackend> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Register a concrete backend type; handles the `Arc` erasure.
pub fn register_native_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: NativeBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    register_backend(name, move || Arc::new(constructor()) as Arc<dyn NativeBackend>);
}

/// Create a backend instance by name, or `None` if nothing is registered under it.
pub fn create_backend(name: &str) -> Option<Arc<dyn NativeBackend>> {
    global_registry().create(name)
}

/// Registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}
