use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::NativeBackend;
use crate::env;
use crate::error::{WebnnError, WebnnResult};
use crate::graph::GraphBuilder;
use crate::registry;
use crate::scope::{ErrorFilter, ErrorReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DevicePreference {
    #[default]
    Default,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerPreference {
    #[default]
    Default,
    HighPerformance,
    LowPower,
}

/// Options a context is created with. Preferences are advisory hints passed along to backends
/// that care about them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub device_preference: DevicePreference,
    pub power_preference: PowerPreference,
    /// Smallest allocation made by a graph's resource pool.
    pub min_buffer_bytes: u64,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            device_preference: DevicePreference::Default,
            power_preference: PowerPreference::Default,
            min_buffer_bytes: env::min_buffer_bytes(),
        }
    }
}

/// Binds graphs to one native backend.
///
/// Clones share the backend and the error scope stack.
#[derive(Clone)]
pub struct Context {
    backend: Arc<dyn NativeBackend>,
    options: ContextOptions,
    errors: ErrorReporter,
}

impl Context {
    pub fn new(backend: Arc<dyn NativeBackend>, options: ContextOptions) -> Self {
        Self {
            backend,
            options,
            errors: ErrorReporter::new(),
        }
    }

    /// Creates a context on a registered backend.
    pub fn from_registry(name: &str, options: ContextOptions) -> WebnnResult<Self> {
        let backend = registry::create_backend(name).ok_or_else(|| {
            WebnnError::validation(format!(
                "backend {name} is not registered (available: {:?})",
                registry::list_backends()
            ))
        })?;
        Ok(Self::new(backend, options))
    }

    /// Creates a context on the backend named by `WEBNNRS_BACKEND` (default `cpu`).
    pub fn from_env() -> WebnnResult<Self> {
        Self::from_registry(env::default_backend(), ContextOptions::default())
    }

    /// Builders created here report build, compile and compute errors to the context's scopes.
    pub fn create_builder(&self) -> GraphBuilder {
        GraphBuilder::new(Arc::clone(&self.backend), self.options.min_buffer_bytes)
            .with_error_reporter(self.errors.clone())
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        self.errors.push_scope(filter);
    }

    /// Closes the innermost error scope, returning the first error it captured. Fails when no
    /// scope is open.
    pub fn pop_error_scope(&self) -> WebnnResult<Option<WebnnError>> {
        self.errors.pop_scope()
    }

    /// Receives errors no open scope captured. Replaces any earlier callback.
    pub fn set_uncaptured_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&WebnnError) + Send + 'static,
    {
        self.errors.set_uncaptured_callback(Some(Box::new(callback)));
    }

    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }
}
