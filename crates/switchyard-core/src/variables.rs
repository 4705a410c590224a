//! Variable resolution port.
//!
//! Steps reference external variables and credentials as `{{ vars.KEY }}`.
//! The engine treats lookup as an opaque key-value service: anything
//! implementing [`VariableResolver`] can be injected.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VariableError {
    #[error("variable backend unavailable: {0}")]
    Unavailable(String),

    #[error("variable '{0}' is not valid UTF-8")]
    InvalidValue(String),
}

/// Key-value lookup for step variables.
pub trait VariableResolver: Send + Sync {
    /// `Ok(None)` when this resolver does not know the key.
    fn resolve(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, VariableError>> + Send;
}

/// Object-safe companion of [`VariableResolver`].
pub trait VariableResolverDyn: Send + Sync {
    fn resolve_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, VariableError>> + Send + 'a>>;
}

impl<T: VariableResolver> VariableResolverDyn for T {
    fn resolve_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, VariableError>> + Send + 'a>> {
        Box::pin(self.resolve(key))
    }
}

pub type DynVariableResolver = Arc<dyn VariableResolverDyn>;

/// Fixed in-memory variables.
#[derive(Debug, Clone, Default)]
pub struct StaticVariables {
    values: HashMap<String, String>,
}

impl StaticVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl VariableResolver for StaticVariables {
    async fn resolve(&self, key: &str) -> Result<Option<String>, VariableError> {
        Ok(self.values.get(key).cloned())
    }
}

/// Tries each resolver in order; first hit wins.
pub struct ChainedVariables {
    chain: Vec<DynVariableResolver>,
}

impl ChainedVariables {
    pub fn new(chain: Vec<DynVariableResolver>) -> Self {
        Self { chain }
    }
}

impl VariableResolver for ChainedVariables {
    async fn resolve(&self, key: &str) -> Result<Option<String>, VariableError> {
        for resolver in &self.chain {
            if let Some(value) = resolver.resolve_boxed(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}
