//! Environment-backed variable resolver.
//!
//! `{{ vars.API_HOST }}` resolves to `SWITCHYARD_VAR_API_HOST`. Keys are
//! upper-cased and `-`/`.` become `_`, so `vars.api-host` works too.

use switchyard_core::variables::{VariableError, VariableResolver};

pub const DEFAULT_PREFIX: &str = "SWITCHYARD_VAR_";

/// Read-only resolver over process environment variables.
#[derive(Debug, Clone)]
pub struct EnvVariables {
    prefix: String,
}

impl EnvVariables {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_name(&self, key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }
}

impl Default for EnvVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableResolver for EnvVariables {
    async fn resolve(&self, key: &str) -> Result<Option<String>, VariableError> {
        match std::env::var(self.env_name(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(VariableError::InvalidValue(key.to_string())),
        }
    }
}
