//! Kind dispatch: one controller per workload kind.

use async_trait::async_trait;

use topo_state::{Member, Volume, WorkloadSpec};

use crate::action::Action;
use crate::cancel::Cancel;
use crate::error::ControllerResult;

/// Observed state of one workload at the start of a planning step.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    /// Members in id order.
    pub members: Vec<Member>,
    /// Volumes in ordinal order (stateful only).
    pub volumes: Vec<Volume>,
    /// Revision hash of the desired spec.
    pub revision: String,
}

#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Next actions toward the desired state. Empty when converged.
    fn plan(&self, spec: &WorkloadSpec, observed: &Observed) -> Vec<Action>;

    /// Execute a plan. Returns the number of actions completed.
    async fn execute(
        &self,
        spec: &WorkloadSpec,
        actions: Vec<Action>,
        cancel: &Cancel,
    ) -> ControllerResult<u32>;
}
