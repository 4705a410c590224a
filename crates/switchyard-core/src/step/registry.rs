//! Step type registry: type name to handler.
//!
//! New step types register here without touching the scheduler. The
//! registry is built once and injected into the scheduler and validator.

use std::collections::HashMap;
use std::sync::Arc;

use super::{StepDescriptor, StepHandler, StepHandlerDyn, builtin};

#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in step type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a handler under its descriptor's type name, replacing any
    /// previous handler for that name.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        self.register_shared(Arc::new(handler));
    }

    pub fn register_shared(&mut self, handler: Arc<dyn StepHandlerDyn>) {
        let name = handler.descriptor().type_name.clone();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(step_type = %name, "replaced step handler");
        }
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Descriptors sorted by type name.
    pub fn descriptors(&self) -> Vec<&StepDescriptor> {
        let mut out: Vec<&StepDescriptor> =
            self.handlers.values().map(|h| h.descriptor()).collect();
        out.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        out
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("StepRegistry").field("types", &names).finish()
    }
}
