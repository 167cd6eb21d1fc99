//! In-memory substrate.
//!
//! Members live in a map and become ready after a configurable number of
//! probes. Fault injection hooks let tests (and `substrate = "sim"`
//! deployments) exercise failed creations, members that never become
//! ready, and liveness failures. Every call is recorded in an op log.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use topo_state::MemberId;
use tracing::debug;

use crate::error::{SubstrateError, SubstrateResult};
use crate::substrate::{MemberHandle, MemberSpec, ProbeResult, Substrate, VolumeClaim};

/// One recorded substrate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Create {
        workload: String,
        member: MemberId,
        revision: String,
        volume_id: Option<String>,
    },
    Terminate {
        workload: String,
        member: MemberId,
    },
    ProvisionVolume {
        volume_id: String,
    },
    DeleteVolume {
        volume_id: String,
    },
}

struct SimMember {
    workload: String,
    member: MemberId,
    address: String,
    image: String,
    probes_until_ready: u32,
    ready: bool,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    members: HashMap<String, SimMember>,
    volumes: HashMap<String, u64>,
    ready_after: u32,
    failing_creates: HashMap<String, u32>,
    never_ready_images: HashSet<String>,
    rejected_images: HashSet<String>,
    unhealthy_addresses: HashSet<String>,
    terminate_delay: Duration,
    log: Vec<SimOp>,
    /// `(workload, ready, not_ready)` after every create and terminate.
    samples: Vec<(String, usize, usize)>,
}

impl SimState {
    fn sample(&mut self, workload: &str) {
        let (ready, not_ready) = self
            .members
            .values()
            .filter(|m| m.workload == workload)
            .fold((0, 0), |(r, n), m| if m.ready { (r + 1, n) } else { (r, n + 1) });
        self.samples.push((workload.to_string(), ready, not_ready));
    }
}

#[derive(Default)]
pub struct SimSubstrate {
    state: Mutex<SimState>,
}

impl SimSubstrate {
    /// Members are ready on their first probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Members report not-ready for the first `probes` probes.
    pub fn with_ready_after(probes: u32) -> Self {
        let sim = Self::default();
        sim.lock().ready_after = probes;
        sim
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim substrate lock")
    }

    /// Fail the next `count` creations for `workload` with a transient error.
    pub fn fail_next_creates(&self, workload: &str, count: u32) {
        self.lock()
            .failing_creates
            .insert(workload.to_string(), count);
    }

    /// Members created from `image` start but never pass readiness.
    pub fn set_never_ready(&self, image: &str) {
        self.lock().never_ready_images.insert(image.to_string());
    }

    /// Creating a member from `image` fails permanently.
    pub fn reject_image(&self, image: &str) {
        self.lock().rejected_images.insert(image.to_string());
    }

    /// Force probes against `address` to fail (or succeed again).
    pub fn set_unhealthy(&self, address: &str, unhealthy: bool) {
        let mut state = self.lock();
        if unhealthy {
            state.unhealthy_addresses.insert(address.to_string());
        } else {
            state.unhealthy_addresses.remove(address);
        }
    }

    /// Terminations take `delay` before the member is gone.
    pub fn set_terminate_delay(&self, delay: Duration) {
        self.lock().terminate_delay = delay;
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.lock().log.clone()
    }

    /// Live member ids of a workload, sorted.
    pub fn live_members(&self, workload: &str) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .lock()
            .members
            .values()
            .filter(|m| m.workload == workload)
            .map(|m| m.member.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Images of live members of a workload, sorted.
    pub fn live_images(&self, workload: &str) -> Vec<String> {
        let mut images: Vec<String> = self
            .lock()
            .members
            .values()
            .filter(|m| m.workload == workload)
            .map(|m| m.image.clone())
            .collect();
        images.sort();
        images
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().volumes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(ready, not_ready)` member counts of `workload` after each create
    /// or terminate, oldest first.
    pub fn samples(&self, workload: &str) -> Vec<(usize, usize)> {
        self.lock()
            .samples
            .iter()
            .filter(|(w, _, _)| w == workload)
            .map(|(_, r, n)| (*r, *n))
            .collect()
    }
}

#[async_trait]
impl Substrate for SimSubstrate {
    async fn create(&self, spec: &MemberSpec) -> SubstrateResult<MemberHandle> {
        let mut state = self.lock();

        if state.rejected_images.contains(&spec.image) {
            return Err(SubstrateError::Permanent(format!(
                "image {} cannot be pulled",
                spec.image
            )));
        }
        if let Some(remaining) = state.failing_creates.get_mut(&spec.workload) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SubstrateError::Transient("simulated capacity shortage".into()));
            }
        }
        if let Some(volume_id) = &spec.volume_id {
            if !state.volumes.contains_key(volume_id) {
                return Err(SubstrateError::Permanent(format!(
                    "volume {volume_id} is not provisioned"
                )));
            }
        }

        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        let probes_until_ready = state.ready_after;
        state.members.insert(
            id.clone(),
            SimMember {
                workload: spec.workload.clone(),
                member: spec.member.clone(),
                address: spec.address.clone(),
                image: spec.image.clone(),
                probes_until_ready,
                ready: false,
            },
        );
        state.log.push(SimOp::Create {
            workload: spec.workload.clone(),
            member: spec.member.clone(),
            revision: spec.revision.clone(),
            volume_id: spec.volume_id.clone(),
        });
        state.sample(&spec.workload);
        debug!(handle = %id, workload = %spec.workload, member = %spec.member, "sim member created");

        Ok(MemberHandle {
            id,
            address: spec.address.clone(),
        })
    }

    async fn terminate(&self, handle: &MemberHandle, _grace: Duration) -> SubstrateResult<()> {
        let delay = {
            let mut state = self.lock();
            let Some(member) = state.members.get(&handle.id) else {
                return Ok(());
            };
            let op = SimOp::Terminate {
                workload: member.workload.clone(),
                member: member.member.clone(),
            };
            state.log.push(op);
            state.terminate_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(member) = state.members.remove(&handle.id) {
            state.sample(&member.workload);
            debug!(handle = %handle.id, "sim member terminated");
        }
        Ok(())
    }

    async fn probe(&self, handle: &MemberHandle) -> ProbeResult {
        let mut state = self.lock();
        let (never_ready, forced_down) = match state.members.get(&handle.id) {
            Some(m) => (
                state.never_ready_images.contains(&m.image),
                state.unhealthy_addresses.contains(&m.address),
            ),
            None => return ProbeResult::Failed,
        };
        let Some(member) = state.members.get_mut(&handle.id) else {
            return ProbeResult::Failed;
        };

        if never_ready || forced_down {
            return ProbeResult::Unhealthy;
        }
        if member.probes_until_ready > 0 {
            member.probes_until_ready -= 1;
            return ProbeResult::Unhealthy;
        }
        member.ready = true;
        ProbeResult::Healthy
    }

    async fn provision_volume(&self, claim: &VolumeClaim) -> SubstrateResult<()> {
        let mut state = self.lock();
        if !state.volumes.contains_key(&claim.volume_id) {
            state
                .volumes
                .insert(claim.volume_id.clone(), claim.size_bytes);
            state.log.push(SimOp::ProvisionVolume {
                volume_id: claim.volume_id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> SubstrateResult<()> {
        let mut state = self.lock();
        if state.volumes.remove(volume_id).is_some() {
            state.log.push(SimOp::DeleteVolume {
                volume_id: volume_id.to_string(),
            });
        }
        Ok(())
    }
}
