use std::time::Duration;

use thiserror::Error;

pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Errors reported by a compute substrate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    /// Worth retrying: capacity, network, a member that died on start.
    #[error("transient substrate error: {0}")]
    Transient(String),

    /// Retrying will not help (bad image, unsupported spec).
    #[error("permanent substrate error: {0}")]
    Permanent(String),

    #[error("substrate {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl SubstrateError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, SubstrateError::Permanent(_))
    }
}

/// Errors resolving a secret reference.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {name}/{key} not found")]
    NotFound { name: String, key: String },

    #[error("failed to read secret {name}/{key}: {source}")]
    Io {
        name: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<SecretError> for SubstrateError {
    // A missing secret may still be provisioned by the operator.
    fn from(e: SecretError) -> Self {
        SubstrateError::Transient(e.to_string())
    }
}
