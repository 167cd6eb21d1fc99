//! Rollout controller — decides the next step for a stateless workload.
//!
//! Given the desired replica count and revision and the live members
//! (Running or Pending), [`plan_step`] says how many instances to add,
//! which surplus instances to remove, or which out-of-date instances to
//! replace next. The caller executes the step and plans again until the
//! phase is `Steady`.

use std::cmp::Reverse;

use serde::Serialize;
use tracing::debug;

use topo_state::{Member, MemberId};

use crate::strategy::RollingConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Replica count and revision both match.
    Steady,
    /// Adding or removing instances.
    Scaling { current: u32, desired: u32 },
    /// Replacing out-of-date instances.
    Rolling { updated: u32, total: u32 },
    /// Replacement slots are all in use; wait for in-flight instances.
    Blocked { in_flight: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutStep {
    pub phase: RolloutPhase,
    /// New instances to create at the desired revision.
    pub create: u32,
    /// Surplus instances to remove, in removal order.
    pub remove: Vec<MemberId>,
    /// Out-of-date instances to replace, one replacement slot each.
    pub replace: Vec<MemberId>,
}

impl RolloutStep {
    fn idle(phase: RolloutPhase) -> Self {
        Self {
            phase,
            create: 0,
            remove: Vec::new(),
            replace: Vec::new(),
        }
    }

    pub fn is_steady(&self) -> bool {
        self.phase == RolloutPhase::Steady
    }
}

/// Removal preference for surplus instances: out-of-date revision first,
/// then not yet Running, then newest.
pub fn surplus_order<'a>(members: &'a [Member], revision: &str) -> Vec<&'a Member> {
    let mut ordered: Vec<&Member> = members.iter().collect();
    ordered.sort_by_key(|m| {
        (
            m.revision == revision,
            m.is_running(),
            Reverse(m.created_at),
            Reverse(m.id.clone()),
        )
    });
    ordered
}

pub fn plan_step(
    replicas: u32,
    revision: &str,
    live: &[Member],
    cfg: &RollingConfig,
) -> RolloutStep {
    let current = live.len() as u32;

    if current < replicas {
        return RolloutStep {
            create: replicas - current,
            ..RolloutStep::idle(RolloutPhase::Scaling {
                current,
                desired: replicas,
            })
        };
    }

    if current > replicas {
        let remove = surplus_order(live, revision)
            .into_iter()
            .take((current - replicas) as usize)
            .map(|m| m.id.clone())
            .collect();
        return RolloutStep {
            remove,
            ..RolloutStep::idle(RolloutPhase::Scaling {
                current,
                desired: replicas,
            })
        };
    }

    let mut outdated: Vec<&Member> = live.iter().filter(|m| m.revision != revision).collect();
    if outdated.is_empty() {
        return RolloutStep::idle(RolloutPhase::Steady);
    }

    let in_flight = live.iter().filter(|m| !m.is_running()).count() as u32;
    let slots = cfg.max_unavailable.saturating_sub(in_flight);
    if slots == 0 {
        return RolloutStep::idle(RolloutPhase::Blocked { in_flight });
    }

    // Oldest first.
    outdated.sort_by_key(|m| (m.created_at, m.id.clone()));
    let replace: Vec<MemberId> = outdated
        .iter()
        .take(slots as usize)
        .map(|m| m.id.clone())
        .collect();

    let phase = RolloutPhase::Rolling {
        updated: current - outdated.len() as u32,
        total: replicas,
    };
    debug!(?phase, slots = replace.len(), "rolling replacement step");
    RolloutStep {
        replace,
        ..RolloutStep::idle(phase)
    }
}
