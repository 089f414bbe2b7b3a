//! Operation registry: type name → factory table populated at startup.

use crate::{builtin, Operation, RegistryError};
use df_core::pipeline::OperationSpec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a validated operation instance from its configuration.
pub type OperationFactory =
    Arc<dyn Fn(&OperationSpec) -> Result<Arc<dyn Operation>, RegistryError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) the factory for `type_name`.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&OperationSpec) -> Result<Arc<dyn Operation>, RegistryError> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self.factories.contains_key(&type_name) {
            tracing::debug!(op_type = %type_name, "replacing operation factory");
        }
        self.factories.insert(type_name, Arc::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the operation for `spec` using the factory registered for `type_name`.
    pub fn resolve(
        &self,
        type_name: &str,
        spec: &OperationSpec,
    ) -> Result<Arc<dyn Operation>, RegistryError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownOperationType(type_name.to_string()))?;
        factory(spec)
    }

    /// Build the operation for `spec` using its own type tag.
    pub fn resolve_spec(&self, spec: &OperationSpec) -> Result<Arc<dyn Operation>, RegistryError> {
        self.resolve(&spec.op_type, spec)
    }
}
