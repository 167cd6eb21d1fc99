//! topo.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopoConfig {
    pub daemon: DaemonConfig,
    pub reconcile: ReconcileConfig,
    pub members: MemberConfig,
    pub rollout: RolloutDefaults,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub api: ApiConfig,
}

/// Which compute substrate the daemon drives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateKind {
    /// In-memory simulation; members become ready immediately.
    #[default]
    Sim,
    /// Local child processes probed over HTTP.
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub substrate: SubstrateKind,
    /// Directory of mounted secrets laid out as `<name>/<key>`.
    pub secrets_dir: Option<PathBuf>,
    /// Manifests applied at startup (file or directory).
    pub manifests: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/topo"),
            substrate: SubstrateKind::Sim,
            secrets_dir: None,
            manifests: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Periodic resync interval.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// How long a Degraded workload waits before an automatic retry.
    #[serde(with = "serde_str")]
    pub degraded_retry: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            degraded_retry: Duration::from_secs(300),
        }
    }
}

/// Member lifecycle timeouts and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemberConfig {
    /// Time allowed for a new member to pass its readiness probe.
    #[serde(with = "serde_str")]
    pub ready_timeout: Duration,
    /// Interval between readiness probes while waiting.
    #[serde(with = "serde_str")]
    pub probe_interval: Duration,
    /// Upper bound on a single substrate call.
    #[serde(with = "serde_str")]
    pub op_timeout: Duration,
    /// Grace period handed to the substrate on termination.
    #[serde(with = "serde_str")]
    pub terminate_grace: Duration,
    /// Creation attempts per member (or replacement slot) before giving up.
    pub retry_ceiling: u32,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(1),
            op_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(30),
            retry_ceiling: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutDefaults {
    /// Default bound on simultaneously unavailable stateless instances.
    pub max_unavailable: u32,
}

impl Default for RolloutDefaults {
    fn default() -> Self {
        Self { max_unavailable: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// DNS-style suffix for member and virtual addresses.
    pub domain: String,
    /// Consecutive failed liveness probes before a member is excluded.
    pub failure_threshold: u32,
    /// Consecutive successful probes before an excluded member returns.
    pub success_threshold: u32,
    #[serde(with = "serde_str")]
    pub liveness_interval: Duration,
    /// Excluded members older than this are marked Failed and replaced.
    #[serde(with = "serde_str")]
    pub unhealthy_replace_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domain: "topo.local".to_string(),
            failure_threshold: 3,
            success_threshold: 3,
            liveness_interval: Duration::from_secs(5),
            unhealthy_replace_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Feed refresh interval and default scrape interval.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    pub metrics_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            metrics_path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

impl TopoConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: TopoConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.members.retry_ceiling == 0 {
            anyhow::bail!("members.retry_ceiling must be at least 1");
        }
        if self.registry.failure_threshold == 0 || self.registry.success_threshold == 0 {
            anyhow::bail!("registry thresholds must be at least 1");
        }
        if self.members.backoff_base > self.members.backoff_max {
            anyhow::bail!("members.backoff_base exceeds members.backoff_max");
        }
        Ok(())
    }
}
