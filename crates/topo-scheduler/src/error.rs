//! Controller error types.

use std::time::Duration;

use thiserror::Error;

use topo_runtime::SubstrateError;
use topo_state::{MemberId, StateError};

/// Errors that can occur while reconciling a workload.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("{workload} member {member} failed {attempts} creation attempts")]
    RetryCeilingExceeded {
        workload: String,
        member: MemberId,
        attempts: u32,
    },

    #[error("{workload} member {member} not ready after {after:?}")]
    HealthCheckTimeout {
        workload: String,
        member: MemberId,
        after: Duration,
    },

    #[error("reconciliation of {0} cancelled")]
    Cancelled(String),

    #[error("controller task failed: {0}")]
    TaskFailed(String),

    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ControllerError {
    /// Errors that park the workload in Degraded until a retry. Everything
    /// else is retried on the next tick.
    pub fn is_degrading(&self) -> bool {
        match self {
            ControllerError::RetryCeilingExceeded { .. } => true,
            ControllerError::Substrate(e) => !e.is_transient(),
            ControllerError::State(StateError::Invalid(_)) => true,
            _ => false,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
