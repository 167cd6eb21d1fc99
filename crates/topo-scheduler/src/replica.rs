//! Replica controller — controller for stateless workloads.
//!
//! Instances are interchangeable. Leftovers (Terminating, Failed, or
//! Pending members) are settled first; then the rollout planner decides
//! whether to create, remove or replace. Creations and replacement slots
//! of one step run concurrently.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use topo_rollout::{RollingConfig, plan_step};
use topo_state::{Member, MemberId, MemberPhase, WorkloadSpec};

use crate::action::Action;
use crate::cancel::Cancel;
use crate::controller::{Observed, WorkloadController};
use crate::error::{ControllerError, ControllerResult};
use crate::executor::Executor;

pub struct ReplicaController {
    executor: Executor,
    default_max_unavailable: u32,
}

impl ReplicaController {
    pub fn new(executor: Executor, default_max_unavailable: u32) -> Self {
        Self {
            executor,
            default_max_unavailable,
        }
    }
}

/// Allocates instance ids `{workload}-{revision prefix}-{n}` with the
/// smallest free `n`.
struct InstanceIds {
    prefix: String,
    taken: BTreeSet<String>,
}

impl InstanceIds {
    fn new(workload: &str, revision: &str, members: &[Member]) -> Self {
        let short = &revision[..revision.len().min(6)];
        Self {
            prefix: format!("{workload}-{short}"),
            taken: members.iter().map(|m| m.id.key()).collect(),
        }
    }

    fn next(&mut self) -> MemberId {
        let id = (0u32..)
            .map(|n| format!("{}-{n}", self.prefix))
            .find(|id| !self.taken.contains(id))
            .unwrap_or_else(|| self.prefix.clone());
        self.taken.insert(id.clone());
        MemberId::Instance(id)
    }
}

pub fn plan(spec: &WorkloadSpec, observed: &Observed, default_max_unavailable: u32) -> Vec<Action> {
    let settle: Vec<Action> = observed
        .members
        .iter()
        .filter_map(|m| match m.phase {
            MemberPhase::Pending if m.handle.is_some() => Some(Action::AwaitReady {
                member: m.id.clone(),
            }),
            MemberPhase::Pending | MemberPhase::Terminating | MemberPhase::Failed => {
                Some(Action::Terminate {
                    member: m.id.clone(),
                    release_volume: false,
                })
            }
            MemberPhase::Running => None,
        })
        .collect();
    if !settle.is_empty() {
        return settle;
    }

    let cfg = RollingConfig::for_workload(spec, default_max_unavailable);
    let step = plan_step(spec.replicas, &observed.revision, &observed.members, &cfg);
    let mut ids = InstanceIds::new(&spec.name, &observed.revision, &observed.members);

    let mut actions: Vec<Action> = (0..step.create)
        .map(|_| Action::Create {
            member: ids.next(),
            volume: None,
        })
        .collect();
    actions.extend(step.remove.into_iter().map(|member| Action::Terminate {
        member,
        release_volume: false,
    }));
    actions.extend(step.replace.into_iter().map(|old| Action::Replace {
        old,
        new: ids.next(),
    }));
    actions
}

#[async_trait]
impl WorkloadController for ReplicaController {
    fn plan(&self, spec: &WorkloadSpec, observed: &Observed) -> Vec<Action> {
        plan(spec, observed, self.default_max_unavailable)
    }

    async fn execute(
        &self,
        spec: &WorkloadSpec,
        actions: Vec<Action>,
        cancel: &Cancel,
    ) -> ControllerResult<u32> {
        let mut done = 0;
        let mut slots = JoinSet::new();

        for action in actions {
            debug!(workload = %spec.name, %action, "executing");
            match action {
                Action::Terminate {
                    member,
                    release_volume,
                } => {
                    self.executor
                        .terminate_member(&spec.name, &member, release_volume)
                        .await?;
                    done += 1;
                }
                Action::AwaitReady { member } => {
                    self.executor.await_member(spec, &member, cancel).await?;
                    done += 1;
                }
                Action::Create { member, .. } | Action::Recreate { member, .. } => {
                    let (executor, spec, cancel) =
                        (self.executor.clone(), spec.clone(), cancel.clone());
                    slots.spawn(async move {
                        executor
                            .create_member(&spec, &member, None, &cancel)
                            .await
                            .map(|_| ())
                    });
                }
                Action::Replace { old, new } => {
                    let (executor, spec, cancel) =
                        (self.executor.clone(), spec.clone(), cancel.clone());
                    slots.spawn(async move {
                        executor.replace_member(&spec, &old, &new, &cancel).await
                    });
                }
            }
        }

        // Let every slot finish; report the most severe failure.
        let mut failure: Option<ControllerError> = None;
        while let Some(joined) = slots.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(ControllerError::TaskFailed(e.to_string())));
            match result {
                Ok(()) => done += 1,
                Err(e) => {
                    let replace = failure
                        .as_ref()
                        .is_none_or(|f| !f.is_degrading() && e.is_degrading());
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }
}
