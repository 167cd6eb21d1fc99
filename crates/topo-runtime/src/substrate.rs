//! The compute substrate interface.
//!
//! The reconciler never runs workloads itself: it asks a [`Substrate`] to
//! create, probe and terminate members and to provision volumes. All calls
//! are bounded by [`bounded`] at the call site.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use topo_state::MemberId;

use crate::error::{SubstrateError, SubstrateResult};
use crate::secrets::ResolvedEnv;

/// Result of a single readiness or liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The member answered and reports ready.
    Healthy,
    /// The member answered but is not ready.
    Unhealthy,
    /// The probe could not be executed (connection error, process gone).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        *self == ProbeResult::Healthy
    }
}

/// Everything the substrate needs to start one member.
#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub workload: String,
    pub member: MemberId,
    /// Address the member should answer on; the substrate may override it.
    pub address: String,
    pub image: String,
    pub ports: Vec<u16>,
    pub env: ResolvedEnv,
    /// Volume to attach, already provisioned.
    pub volume_id: Option<String>,
    pub revision: String,
}

/// Substrate-side identity of a running member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberHandle {
    pub id: String,
    pub address: String,
}

/// Request for a persistent volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    pub volume_id: String,
    pub workload: String,
    pub ordinal: u32,
    pub size_bytes: u64,
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Start a member. Returns once the substrate has accepted it; readiness
    /// is observed separately through [`Substrate::probe`].
    async fn create(&self, spec: &MemberSpec) -> SubstrateResult<MemberHandle>;

    /// Stop a member, allowing it `grace` to shut down cleanly. Terminating
    /// an unknown handle succeeds.
    async fn terminate(&self, handle: &MemberHandle, grace: Duration) -> SubstrateResult<()>;

    async fn probe(&self, handle: &MemberHandle) -> ProbeResult;

    /// Provision a volume. Provisioning an existing volume id succeeds.
    async fn provision_volume(&self, claim: &VolumeClaim) -> SubstrateResult<()>;

    /// Destroy a volume and its data.
    async fn delete_volume(&self, volume_id: &str) -> SubstrateResult<()>;
}

/// Run a substrate call under a deadline.
pub async fn bounded<T, F>(op: &'static str, limit: Duration, fut: F) -> SubstrateResult<T>
where
    F: Future<Output = SubstrateResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SubstrateError::Timeout { op, after: limit }),
    }
}
