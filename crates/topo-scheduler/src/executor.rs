//! Action executor — drives members through the substrate.
//!
//! Every substrate call is bounded by `members.op_timeout`. A new member
//! is created, probed until Running or `ready_timeout`, and on failure
//! terminated and retried with exponential backoff until the retry
//! ceiling. The member record in the store tracks each step so a
//! restarted daemon picks up where it left off.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use topo_core::config::MemberConfig;
use topo_health::Backoff;
use topo_proxy::{ProxySync, member_address};
use topo_rollout::revision_hash;
use topo_runtime::{
    MemberHandle, MemberSpec, ProbeResult, SecretStore, Substrate, SubstrateResult, VolumeClaim,
    bounded, resolve_env,
};
use topo_state::{
    Member, MemberId, MemberPhase, StateStore, Volume, VolumeState, WorkloadSpec, epoch_secs,
};

use crate::action::VolumeBinding;
use crate::cancel::Cancel;
use crate::error::{ControllerError, ControllerResult};

#[derive(Clone)]
pub struct Executor {
    state: StateStore,
    substrate: Arc<dyn Substrate>,
    secrets: Arc<dyn SecretStore>,
    proxy: ProxySync,
    config: MemberConfig,
}

impl Executor {
    pub fn new(
        state: StateStore,
        substrate: Arc<dyn Substrate>,
        secrets: Arc<dyn SecretStore>,
        proxy: ProxySync,
        config: MemberConfig,
    ) -> Self {
        Self {
            state,
            substrate,
            secrets,
            proxy,
            config,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn proxy(&self) -> &ProxySync {
        &self.proxy
    }

    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_base, self.config.backoff_max)
    }

    /// Push a workload's member set to the service registry.
    pub fn publish(&self, workload: &str) -> ControllerResult<()> {
        self.proxy.refresh_members(&self.state, workload)?;
        Ok(())
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create a member (or restart a known one) and wait until it is
    /// Running, retrying with backoff.
    pub async fn create_member(
        &self,
        spec: &WorkloadSpec,
        id: &MemberId,
        volume: Option<&VolumeBinding>,
        cancel: &Cancel,
    ) -> ControllerResult<Member> {
        let workload = spec.name.as_str();
        let revision = revision_hash(spec);
        let now = epoch_secs();

        let mut member = match self.state.get_member(workload, id)? {
            Some(existing) => existing,
            None => Member {
                workload: workload.to_string(),
                id: id.clone(),
                address: member_address(workload, id, self.proxy.registry().domain()),
                phase: MemberPhase::Pending,
                revision: revision.clone(),
                handle: None,
                volume_id: None,
                attempts: 0,
                created_at: now,
                updated_at: now,
            },
        };
        member.revision = revision;
        member.address = member_address(workload, id, self.proxy.registry().domain());
        if let Some(binding) = volume {
            self.bind_volume(spec, id, binding).await?;
            member.volume_id = Some(binding.volume_id().to_string());
        }

        loop {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled(workload.to_string()));
            }
            if member.attempts >= self.config.retry_ceiling {
                self.set_phase(&mut member, MemberPhase::Failed)?;
                return Err(ControllerError::RetryCeilingExceeded {
                    workload: workload.to_string(),
                    member: id.clone(),
                    attempts: member.attempts,
                });
            }

            member.handle = None;
            self.set_phase(&mut member, MemberPhase::Pending)?;

            match self.start(spec, &member).await {
                Ok(handle) => {
                    member.handle = Some(handle.id.clone());
                    member.address = handle.address.clone();
                    self.set_phase(&mut member, MemberPhase::Pending)?;

                    match self.wait_ready(workload, id, &handle, cancel).await {
                        Ok(()) => {
                            self.mark_running(&mut member)?;
                            info!(%workload, member = %id, attempts = member.attempts, "member running");
                            return Ok(member);
                        }
                        Err(ControllerError::Cancelled(w)) => {
                            return Err(ControllerError::Cancelled(w));
                        }
                        Err(e) => {
                            warn!(%workload, member = %id, error = %e, "member failed readiness");
                            self.stop(&handle).await;
                            member.handle = None;
                        }
                    }
                }
                Err(e) if !e.is_transient() => {
                    warn!(%workload, member = %id, error = %e, "member creation rejected");
                    self.set_phase(&mut member, MemberPhase::Failed)?;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(%workload, member = %id, error = %e, "member creation failed");
                }
            }

            member.attempts += 1;
            self.set_phase(&mut member, MemberPhase::Failed)?;
            if member.attempts >= self.config.retry_ceiling {
                return Err(ControllerError::RetryCeilingExceeded {
                    workload: workload.to_string(),
                    member: id.clone(),
                    attempts: member.attempts,
                });
            }

            let delay = self.backoff().delay(member.attempts);
            debug!(%workload, member = %id, attempt = member.attempts, ?delay, "retrying member creation");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(ControllerError::Cancelled(workload.to_string()));
                }
            }
        }
    }

    async fn start(&self, spec: &WorkloadSpec, member: &Member) -> SubstrateResult<MemberHandle> {
        let env = resolve_env(&spec.env, self.secrets.as_ref())?;
        let request = MemberSpec {
            workload: spec.name.clone(),
            member: member.id.clone(),
            address: member.address.clone(),
            image: spec.image.clone(),
            ports: spec.ports.iter().copied().collect(),
            env,
            volume_id: member.volume_id.clone(),
            revision: member.revision.clone(),
        };
        bounded(
            "create",
            self.config.op_timeout,
            self.substrate.create(&request),
        )
        .await
    }

    /// Probe until the member reports ready, `ready_timeout` elapses, or the
    /// worker is cancelled.
    async fn wait_ready(
        &self,
        workload: &str,
        id: &MemberId,
        handle: &MemberHandle,
        cancel: &Cancel,
    ) -> ControllerResult<()> {
        let probing = async {
            loop {
                if self.probe(handle).await.is_healthy() {
                    return;
                }
                tokio::time::sleep(self.config.probe_interval).await;
            }
        };

        tokio::select! {
            ready = tokio::time::timeout(self.config.ready_timeout, probing) => {
                ready.map_err(|_| ControllerError::HealthCheckTimeout {
                    workload: workload.to_string(),
                    member: id.clone(),
                    after: self.config.ready_timeout,
                })
            }
            _ = cancel.cancelled() => Err(ControllerError::Cancelled(workload.to_string())),
        }
    }

    async fn probe(&self, handle: &MemberHandle) -> ProbeResult {
        tokio::time::timeout(self.config.op_timeout, self.substrate.probe(handle))
            .await
            .unwrap_or(ProbeResult::Failed)
    }

    /// Wait for a Pending member that already has a substrate handle.
    /// A member that never becomes ready is stopped and marked Failed.
    pub async fn await_member(
        &self,
        spec: &WorkloadSpec,
        id: &MemberId,
        cancel: &Cancel,
    ) -> ControllerResult<()> {
        let workload = spec.name.as_str();
        let Some(mut member) = self.state.get_member(workload, id)? else {
            return Ok(());
        };
        let Some(handle_id) = member.handle.clone() else {
            self.set_phase(&mut member, MemberPhase::Failed)?;
            return Ok(());
        };
        let handle = MemberHandle {
            id: handle_id,
            address: member.address.clone(),
        };

        match self.wait_ready(workload, id, &handle, cancel).await {
            Ok(()) => {
                self.mark_running(&mut member)?;
                info!(%workload, member = %id, "pending member became ready");
                Ok(())
            }
            Err(ControllerError::HealthCheckTimeout { .. }) => {
                warn!(%workload, member = %id, "pending member never became ready");
                self.stop(&handle).await;
                member.handle = None;
                member.attempts += 1;
                self.set_phase(&mut member, MemberPhase::Failed)
            }
            Err(e) => Err(e),
        }
    }

    /// Terminate a member's process (if any) and recreate it in place.
    pub async fn recreate_member(
        &self,
        spec: &WorkloadSpec,
        id: &MemberId,
        volume: Option<&VolumeBinding>,
        cancel: &Cancel,
    ) -> ControllerResult<Member> {
        if let Some(mut member) = self.state.get_member(&spec.name, id)? {
            if let Some(handle_id) = member.handle.clone() {
                self.set_phase(&mut member, MemberPhase::Terminating)?;
                self.publish(&spec.name)?;
                self.terminate_handle(&handle_id, &member.address).await?;
                member.handle = None;
                self.set_phase(&mut member, MemberPhase::Terminating)?;
            }
        }
        self.create_member(spec, id, volume, cancel).await
    }

    /// Create `new`, then terminate `old` once `new` is Running. If `new`
    /// cannot be brought up, it is discarded and `old` is left untouched.
    pub async fn replace_member(
        &self,
        spec: &WorkloadSpec,
        old: &MemberId,
        new: &MemberId,
        cancel: &Cancel,
    ) -> ControllerResult<()> {
        match self.create_member(spec, new, None, cancel).await {
            Ok(_) => self.terminate_member(&spec.name, old, false).await,
            Err(ControllerError::Cancelled(w)) => Err(ControllerError::Cancelled(w)),
            Err(e) => {
                warn!(workload = %spec.name, %old, %new, error = %e, "replacement failed, keeping old member");
                if let Err(discard) = self.terminate_member(&spec.name, new, false).await {
                    warn!(workload = %spec.name, member = %new, error = %discard, "failed to discard replacement");
                }
                Err(e)
            }
        }
    }

    // ── Termination ────────────────────────────────────────────────

    /// Gracefully terminate a member and delete its record. The member
    /// leaves the registry before the substrate is asked to stop it.
    pub async fn terminate_member(
        &self,
        workload: &str,
        id: &MemberId,
        release_volume: bool,
    ) -> ControllerResult<()> {
        let Some(mut member) = self.state.get_member(workload, id)? else {
            return Ok(());
        };
        self.set_phase(&mut member, MemberPhase::Terminating)?;
        self.publish(workload)?;

        if let Some(handle_id) = &member.handle {
            self.terminate_handle(handle_id, &member.address).await?;
        }
        self.state.delete_member(workload, id)?;

        if release_volume {
            if let Some(ordinal) = id.ordinal() {
                self.release_volume(workload, ordinal)?;
            }
        }
        self.publish(workload)?;
        info!(%workload, member = %id, "member terminated");
        Ok(())
    }

    async fn terminate_handle(&self, handle_id: &str, address: &str) -> ControllerResult<()> {
        let handle = MemberHandle {
            id: handle_id.to_string(),
            address: address.to_string(),
        };
        let grace = self.config.terminate_grace;
        bounded(
            "terminate",
            grace + self.config.op_timeout,
            self.substrate.terminate(&handle, grace),
        )
        .await?;
        Ok(())
    }

    /// Best-effort stop of a member that failed to come up.
    async fn stop(&self, handle: &MemberHandle) {
        if let Err(e) = bounded(
            "terminate",
            self.config.op_timeout,
            self.substrate.terminate(handle, Duration::ZERO),
        )
        .await
        {
            warn!(handle = %handle.id, error = %e, "failed to stop member");
        }
    }

    // ── Volumes ────────────────────────────────────────────────────

    async fn bind_volume(
        &self,
        spec: &WorkloadSpec,
        id: &MemberId,
        binding: &VolumeBinding,
    ) -> ControllerResult<()> {
        let Some(ordinal) = id.ordinal() else {
            return Ok(());
        };
        let existing = self.state.get_volume(&spec.name, ordinal)?;
        let size_bytes = match (binding, &existing) {
            (_, Some(volume)) => volume.size_bytes,
            (VolumeBinding::Provision { size_bytes, .. }, None) => *size_bytes,
            (VolumeBinding::Rebind { .. }, None) => {
                spec.volume.as_ref().map(|v| v.size_bytes).unwrap_or_default()
            }
        };

        let claim = VolumeClaim {
            volume_id: binding.volume_id().to_string(),
            workload: spec.name.clone(),
            ordinal,
            size_bytes,
        };
        // Provisioning is idempotent, so rebinding also re-asserts the volume.
        bounded(
            "provision_volume",
            self.config.op_timeout,
            self.substrate.provision_volume(&claim),
        )
        .await?;

        let now = epoch_secs();
        match existing {
            Some(volume) => {
                debug!(workload = %spec.name, ordinal, volume = %volume.id, "rebinding volume");
            }
            None => {
                info!(workload = %spec.name, ordinal, volume = %claim.volume_id, size_bytes, "volume provisioned");
                self.state.put_volume(&Volume {
                    id: claim.volume_id,
                    workload: spec.name.clone(),
                    ordinal,
                    size_bytes,
                    state: VolumeState::Unbound,
                    created_at: now,
                    updated_at: now,
                })?;
            }
        }
        Ok(())
    }

    fn release_volume(&self, workload: &str, ordinal: u32) -> ControllerResult<()> {
        if let Some(mut volume) = self.state.get_volume(workload, ordinal)? {
            volume.state = VolumeState::Released;
            volume.updated_at = epoch_secs();
            self.state.put_volume(&volume)?;
            info!(%workload, ordinal, volume = %volume.id, "volume released");
        }
        Ok(())
    }

    /// Destroy a Released volume through the substrate and forget it.
    pub async fn delete_volume(&self, volume: &Volume) -> ControllerResult<()> {
        bounded(
            "delete_volume",
            self.config.op_timeout,
            self.substrate.delete_volume(&volume.id),
        )
        .await?;
        self.state.delete_volume(&volume.workload, volume.ordinal)?;
        info!(workload = %volume.workload, volume = %volume.id, "volume purged");
        Ok(())
    }

    // ── Records ────────────────────────────────────────────────────

    fn set_phase(&self, member: &mut Member, phase: MemberPhase) -> ControllerResult<()> {
        member.phase = phase;
        member.updated_at = epoch_secs();
        self.state.put_member(member)?;
        Ok(())
    }

    fn mark_running(&self, member: &mut Member) -> ControllerResult<()> {
        self.set_phase(member, MemberPhase::Running)?;
        if let (Some(ordinal), Some(_)) = (member.id.ordinal(), &member.volume_id) {
            if let Some(mut volume) = self.state.get_volume(&member.workload, ordinal)? {
                if volume.state != VolumeState::Bound {
                    volume.state = VolumeState::Bound;
                    volume.updated_at = epoch_secs();
                    self.state.put_volume(&volume)?;
                }
            }
        }
        self.publish(&member.workload)
    }
}
