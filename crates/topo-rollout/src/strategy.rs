//! Rolling update configuration.

use serde::{Deserialize, Serialize};

use topo_state::WorkloadSpec;

/// Bounds on a rolling replacement of stateless instances.
///
/// Each replacement slot creates the new instance first and removes the
/// old one only after the new one is Running, so at most
/// `max_unavailable` instances are ever not Running and the Running count
/// never drops below `min_available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingConfig {
    pub max_unavailable: u32,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self { max_unavailable: 1 }
    }
}

impl RollingConfig {
    /// The workload's own bound, else the daemon default.
    pub fn for_workload(spec: &WorkloadSpec, default_max_unavailable: u32) -> Self {
        Self {
            max_unavailable: spec
                .max_unavailable
                .unwrap_or(default_max_unavailable)
                .max(1),
        }
    }

    /// Lowest Running count tolerated while rolling `replicas` instances.
    pub fn min_available(&self, replicas: u32) -> u32 {
        replicas.saturating_sub(self.max_unavailable).max(1)
    }
}
