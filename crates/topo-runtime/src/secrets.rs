//! Secret resolution.
//!
//! Workload env vars may reference secrets held by an external store.
//! References are resolved at member-creation time only; resolved values
//! live in [`ResolvedEnv`], whose `Debug` output redacts them, and are
//! handed straight to the substrate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use topo_state::{EnvValue, SecretRef};

use crate::error::SecretError;

/// Source of secret values.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError>;
}

/// In-memory secrets, keyed by `(name, key)`.
#[derive(Default)]
pub struct StaticSecretStore {
    values: HashMap<(String, String), String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, key: &str, value: &str) -> Self {
        self.insert(name, key, value);
        self
    }

    pub fn insert(&mut self, name: &str, key: &str, value: &str) {
        self.values
            .insert((name.to_string(), key.to_string()), value.to_string());
    }
}

impl SecretStore for StaticSecretStore {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError> {
        self.values
            .get(&(secret.name.clone(), secret.key.clone()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                name: secret.name.clone(),
                key: secret.key.clone(),
            })
    }
}

/// Secrets mounted on disk as `<root>/<name>/<key>` files.
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SecretStore for FileSecretStore {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError> {
        // Names are validated DNS labels; keys must not escape the secret dir.
        if secret.key.contains('/') || secret.key.contains("..") {
            return Err(SecretError::NotFound {
                name: secret.name.clone(),
                key: secret.key.clone(),
            });
        }
        let path = self.root.join(&secret.name).join(&secret.key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(value.trim_end_matches(['\n', '\r']).to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SecretError::NotFound {
                name: secret.name.clone(),
                key: secret.key.clone(),
            }),
            Err(source) => Err(SecretError::Io {
                name: secret.name.clone(),
                key: secret.key.clone(),
                source,
            }),
        }
    }
}

/// Fully resolved environment for one member.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    vars: BTreeMap<String, String>,
    secret_names: Vec<String>,
}

impl ResolvedEnv {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Debug for ResolvedEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.vars {
            if self.secret_names.contains(k) {
                map.entry(k, &"<redacted>");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

/// Resolve every env entry of a workload, failing on the first missing secret.
pub fn resolve_env(
    env: &BTreeMap<String, EnvValue>,
    secrets: &dyn SecretStore,
) -> Result<ResolvedEnv, SecretError> {
    let mut resolved = ResolvedEnv::default();
    for (name, value) in env {
        let value = match value {
            EnvValue::Literal(v) => v.clone(),
            EnvValue::Secret { secret_ref } => {
                resolved.secret_names.push(name.clone());
                secrets.resolve(secret_ref)?
            }
        };
        resolved.vars.insert(name.clone(), value);
    }
    Ok(resolved)
}
