//! Domain types for the topo resource store.
//!
//! Desired state (workloads, services, ingress rules) is written by
//! operators; observed state (members, volumes, statuses) is written by
//! the controllers. All types are JSON-serialized into redb tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a workload (DNS label).
pub type WorkloadName = String;

/// Name of a service (DNS label).
pub type ServiceName = String;

// ── Workload ──────────────────────────────────────────────────────

/// Whether members have ordered, stable identities or are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Stateful,
    Stateless,
}

/// Reference to a value held by the external secret store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

/// An environment variable: either a literal or a secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Secret { secret_ref: SecretRef },
}

/// Persistent storage requested per stateful member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub size_bytes: u64,
}

/// Optional overrides for how monitoring scrapes a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Port exposing metrics; defaults to the service target port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Desired state of a replicated group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: WorkloadName,
    pub kind: WorkloadKind,
    pub replicas: u32,
    /// Container image reference; opaque to the reconciler.
    pub image: String,
    #[serde(default)]
    pub ports: BTreeSet<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    /// Stateful only.
    #[serde(default)]
    pub volume: Option<VolumeRequest>,
    /// Per-workload override of the rolling-update bound.
    #[serde(default)]
    pub max_unavailable: Option<u32>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Bumped by the store on every accepted change.
    #[serde(default)]
    pub generation: u64,
}

impl WorkloadSpec {
    /// Compare operator-owned fields, ignoring store-managed metadata.
    pub fn same_desired_state(&self, other: &WorkloadSpec) -> bool {
        let mut a = self.clone();
        a.generation = other.generation;
        a == *other
    }

    /// Fields that may not change once the workload exists.
    pub fn immutable_changes(&self, previous: &WorkloadSpec) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.kind != previous.kind {
            changed.push("kind");
        }
        if self.ports != previous.ports {
            changed.push("ports");
        }
        if self.volume != previous.volume {
            changed.push("volume");
        }
        changed
    }

    pub fn is_stateful(&self) -> bool {
        self.kind == WorkloadKind::Stateful
    }
}

// ── Member ────────────────────────────────────────────────────────

/// Identity of a member within its workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemberId {
    /// Stable ordinal of a stateful member.
    Ordinal(u32),
    /// Opaque id of a stateless instance.
    Instance(String),
}

impl MemberId {
    /// Key suffix used in the members table. Ordinals are zero-padded so
    /// that a prefix scan returns them in order.
    pub fn key(&self) -> String {
        match self {
            MemberId::Ordinal(n) => format!("{n:05}"),
            MemberId::Instance(id) => id.clone(),
        }
    }

    pub fn ordinal(&self) -> Option<u32> {
        match self {
            MemberId::Ordinal(n) => Some(*n),
            MemberId::Instance(_) => None,
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberId::Ordinal(n) => write!(f, "#{n}"),
            MemberId::Instance(id) => f.write_str(id),
        }
    }
}

/// Lifecycle phase of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberPhase {
    Pending,
    Running,
    Terminating,
    Failed,
}

impl MemberPhase {
    pub const ALL: [MemberPhase; 4] = [
        MemberPhase::Pending,
        MemberPhase::Running,
        MemberPhase::Terminating,
        MemberPhase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberPhase::Pending => "pending",
            MemberPhase::Running => "running",
            MemberPhase::Terminating => "terminating",
            MemberPhase::Failed => "failed",
        }
    }
}

/// Observed state of a single member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub workload: WorkloadName,
    pub id: MemberId,
    /// Host name or IP clients use to reach the member.
    pub address: String,
    pub phase: MemberPhase,
    /// Revision hash of the spec this member was created from.
    pub revision: String,
    /// Substrate handle, once created.
    pub handle: Option<String>,
    pub volume_id: Option<String>,
    /// Failed creation attempts (stateful/new instances) or failed
    /// replacement attempts (old stateless instances under rollout).
    pub attempts: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Member {
    /// Build the composite key for the members table.
    pub fn table_key(&self) -> String {
        member_key(&self.workload, &self.id)
    }

    pub fn is_running(&self) -> bool {
        self.phase == MemberPhase::Running
    }
}

pub fn member_key(workload: &str, id: &MemberId) -> String {
    format!("{workload}:{}", id.key())
}

// ── Volume ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Unbound,
    Bound,
    Released,
}

impl VolumeState {
    pub const ALL: [VolumeState; 3] = [VolumeState::Unbound, VolumeState::Bound, VolumeState::Released];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Unbound => "unbound",
            VolumeState::Bound => "bound",
            VolumeState::Released => "released",
        }
    }
}

/// Persistent volume tagged to one ordinal of a stateful workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub workload: WorkloadName,
    pub ordinal: u32,
    pub size_bytes: u64,
    pub state: VolumeState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Volume {
    /// Build the composite key for the volumes table.
    pub fn table_key(&self) -> String {
        volume_key(&self.workload, self.ordinal)
    }
}

pub fn volume_key(workload: &str, ordinal: u32) -> String {
    format!("{workload}:{ordinal:05}")
}

/// Deterministic volume id for `(workload, ordinal)`.
pub fn volume_id_for(workload: &str, ordinal: u32) -> String {
    format!("data-{workload}-{ordinal}")
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Resolve to every member address.
    Headless,
    /// Resolve to one stable virtual address.
    LoadBalanced,
}

/// Logical name in front of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: ServiceName,
    pub mode: ServiceMode,
    pub workload: WorkloadName,
    pub external_port: u16,
    pub target_port: u16,
}

// ── Ingress ───────────────────────────────────────────────────────

fn default_ingress_port() -> u16 {
    80
}

/// Maps an external host/path prefix to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub name: String,
    pub host: String,
    pub path_prefix: String,
    pub service: ServiceName,
    #[serde(default = "default_ingress_port")]
    pub port: u16,
    /// Registration order, assigned by the store on first apply.
    #[serde(default)]
    pub seq: u64,
}

impl IngressRule {
    pub fn same_desired_state(&self, other: &IngressRule) -> bool {
        let mut a = self.clone();
        a.seq = other.seq;
        a == *other
    }
}

// ── Monitoring ────────────────────────────────────────────────────

/// One endpoint for the metrics collector to scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub job_name: String,
    pub address: String,
    pub port: u16,
    pub interval_secs: u64,
    pub metrics_path: String,
}

impl ScrapeTarget {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Reconciliation state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    Idle,
    Reconciling,
    Stable,
    Degraded,
}

impl WorkloadPhase {
    pub const ALL: [WorkloadPhase; 4] = [
        WorkloadPhase::Idle,
        WorkloadPhase::Reconciling,
        WorkloadPhase::Stable,
        WorkloadPhase::Degraded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::Idle => "idle",
            WorkloadPhase::Reconciling => "reconciling",
            WorkloadPhase::Stable => "stable",
            WorkloadPhase::Degraded => "degraded",
        }
    }
}

/// Last-known reconciliation outcome for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub workload: WorkloadName,
    pub phase: WorkloadPhase,
    pub message: Option<String>,
    pub observed_generation: u64,
    /// Actions executed by the most recent pass.
    pub last_actions: u32,
    pub updated_at: u64,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
