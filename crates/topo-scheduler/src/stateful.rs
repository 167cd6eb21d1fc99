//! Identity & storage manager — controller for stateful workloads.
//!
//! Members are ordinals `0..replicas` with deterministic addresses. Every
//! plan holds at most one action, so creations, deletions and in-place
//! upgrades happen strictly one member at a time:
//!
//! 1. finish a termination or readiness wait left over from before;
//! 2. scale down from the highest ordinal, releasing its volume;
//! 3. recreate a Failed member;
//! 4. scale up at the lowest missing ordinal, rebinding its volume;
//! 5. upgrade out-of-date members, highest ordinal first.

use async_trait::async_trait;
use tracing::debug;

use topo_state::{Member, MemberId, MemberPhase, Volume, WorkloadSpec, volume_id_for};

use crate::action::{Action, VolumeBinding};
use crate::cancel::Cancel;
use crate::controller::{Observed, WorkloadController};
use crate::error::ControllerResult;
use crate::executor::Executor;

pub struct StatefulController {
    executor: Executor,
}

impl StatefulController {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }
}

/// Volume to attach when (re)creating `ordinal`: any volume already
/// tagged for it, else a new one if the workload requests storage.
pub fn volume_binding(spec: &WorkloadSpec, ordinal: u32, volumes: &[Volume]) -> Option<VolumeBinding> {
    if let Some(existing) = volumes.iter().find(|v| v.ordinal == ordinal) {
        return Some(VolumeBinding::Rebind {
            volume_id: existing.id.clone(),
        });
    }
    spec.volume.as_ref().map(|req| VolumeBinding::Provision {
        volume_id: volume_id_for(&spec.name, ordinal),
        size_bytes: req.size_bytes,
    })
}

fn ordinal_of(member: &Member) -> Option<u32> {
    member.id.ordinal()
}

pub fn plan_next(spec: &WorkloadSpec, observed: &Observed) -> Option<Action> {
    let replicas = spec.replicas;
    let members: Vec<(u32, &Member)> = observed
        .members
        .iter()
        .filter_map(|m| ordinal_of(m).map(|n| (n, m)))
        .collect();
    let recreate = |n: u32| Action::Recreate {
        member: MemberId::Ordinal(n),
        volume: volume_binding(spec, n, &observed.volumes),
    };

    if let Some((n, _)) = members
        .iter()
        .find(|(_, m)| m.phase == MemberPhase::Terminating)
    {
        if *n >= replicas {
            return Some(Action::Terminate {
                member: MemberId::Ordinal(*n),
                release_volume: true,
            });
        }
        return Some(recreate(*n));
    }

    if let Some((n, m)) = members.iter().find(|(_, m)| m.phase == MemberPhase::Pending) {
        if m.handle.is_some() {
            return Some(Action::AwaitReady {
                member: MemberId::Ordinal(*n),
            });
        }
        return Some(recreate(*n));
    }

    if let Some((n, _)) = members.iter().filter(|(n, _)| *n >= replicas).max_by_key(|(n, _)| *n) {
        return Some(Action::Terminate {
            member: MemberId::Ordinal(*n),
            release_volume: true,
        });
    }

    if let Some((n, _)) = members
        .iter()
        .filter(|(_, m)| m.phase == MemberPhase::Failed)
        .min_by_key(|(n, _)| *n)
    {
        return Some(recreate(*n));
    }

    if let Some(missing) = (0..replicas).find(|k| !members.iter().any(|(n, _)| n == k)) {
        return Some(Action::Create {
            member: MemberId::Ordinal(missing),
            volume: volume_binding(spec, missing, &observed.volumes),
        });
    }

    members
        .iter()
        .filter(|(_, m)| m.revision != observed.revision)
        .max_by_key(|(n, _)| *n)
        .map(|(n, _)| recreate(*n))
}

#[async_trait]
impl WorkloadController for StatefulController {
    fn plan(&self, spec: &WorkloadSpec, observed: &Observed) -> Vec<Action> {
        plan_next(spec, observed).into_iter().collect()
    }

    async fn execute(
        &self,
        spec: &WorkloadSpec,
        actions: Vec<Action>,
        cancel: &Cancel,
    ) -> ControllerResult<u32> {
        let mut done = 0;
        for action in actions {
            debug!(workload = %spec.name, %action, "executing");
            match &action {
                Action::Create { member, volume } | Action::Recreate { member, volume } => {
                    self.executor
                        .recreate_member(spec, member, volume.as_ref(), cancel)
                        .await?;
                }
                Action::AwaitReady { member } => {
                    self.executor.await_member(spec, member, cancel).await?;
                }
                Action::Terminate {
                    member,
                    release_volume,
                } => {
                    self.executor
                        .terminate_member(&spec.name, member, *release_volume)
                        .await?;
                }
                Action::Replace { old, new } => {
                    self.executor.replace_member(spec, old, new, cancel).await?;
                }
            }
            done += 1;
        }
        Ok(done)
    }
}
