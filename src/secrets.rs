//! Secret handling for sandbox operations.
//!
//! Resolves secret values from their sources and redacts every known
//! value from text before it is logged or returned to a caller.

use std::env;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::shell;

/// A reference to a secret that should be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the secret.
    pub name: String,
    /// Source of the secret value.
    pub source: SecretSource,
}

/// Source from which to retrieve a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Read from an environment variable.
    EnvVar(String),
    /// Read from a file.
    File(String),
    /// Provided directly (for testing only).
    Direct(String),
}

impl SecretRef {
    /// Resolves the secret value from its source.
    pub fn resolve(&self) -> Result<SecretString, SecretError> {
        let value = match &self.source {
            SecretSource::EnvVar(var_name) => env::var(var_name).map_err(|_| {
                SecretError::NotFound(format!("environment variable '{}' not set", var_name))
            })?,
            SecretSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| SecretError::NotFound(format!("cannot read file '{}': {}", path, e)))?
                .trim()
                .to_string(),
            SecretSource::Direct(value) => value.clone(),
        };
        Ok(SecretString::new(value))
    }
}

/// Shortest env value treated as a secret.
pub const MIN_ENV_SECRET_LEN: usize = 6;

/// Registry of secret values known during one call.
///
/// Cloning is cheap enough to hand a copy to each background task.
#[derive(Clone, Default)]
pub struct SecretsManager {
    /// Registered secrets, longest value first.
    secrets: Vec<(String, SecretString)>,
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("count", &self.secrets.len())
            .finish()
    }
}

impl SecretsManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a secret reference and registers its value.
    pub fn load_secret(&mut self, secret_ref: &SecretRef) -> Result<SecretString, SecretError> {
        let value = secret_ref.resolve()?;
        self.register(&secret_ref.name, &value);
        Ok(value)
    }

    /// Registers a value for redaction. Empty values are ignored.
    pub fn register(&mut self, name: &str, value: &SecretString) {
        let raw = value.expose_secret();
        if raw.is_empty()
            || self
                .secrets
                .iter()
                .any(|(_, v)| v.expose_secret() == raw)
        {
            return;
        }
        self.secrets.push((name.to_string(), value.clone()));
        // Longer values first so a secret containing another is masked whole.
        self.secrets
            .sort_by(|a, b| b.1.expose_secret().len().cmp(&a.1.expose_secret().len()));
    }

    /// Registers every value of a parsed env file.
    ///
    /// Values shorter than [`MIN_ENV_SECRET_LEN`] (flags, ports, `true`)
    /// are skipped.
    pub fn register_env_values(&mut self, entries: &[(String, String)]) {
        for (key, value) in entries {
            if value.chars().count() >= MIN_ENV_SECRET_LEN {
                self.register(key, &SecretString::new(value.clone()));
            }
        }
    }

    /// Redacts all known secret values from a string.
    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, (_, value)| {
                shell::mask_secret(&acc, value.expose_secret())
            })
    }

    /// Returns true if any secrets are registered.
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Returns the number of registered secrets.
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    /// Returns the registered secret names.
    pub fn names(&self) -> Vec<&str> {
        self.secrets.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Error type for secret operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    /// Secret source could not be found or read.
    #[error("secret not found: {0}")]
    NotFound(String),
}

impl From<SecretError> for crate::Error {
    fn from(err: SecretError) -> Self {
        crate::Error::Config(err.to_string())
    }
}
