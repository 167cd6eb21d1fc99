//! Liveness monitor — background task per workload that probes its
//! Running members and reports each result through a callback.
//!
//! The monitor keeps no health state of its own; the service registry
//! feeds results into per-member [`HealthTracker`](crate::HealthTracker)s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use topo_runtime::{MemberHandle, ProbeResult, Substrate};
use topo_state::{MemberId, StateStore};

/// Invoked with `(workload, member, result)` after every liveness probe.
pub type ProbeCallback = Arc<dyn Fn(String, MemberId, ProbeResult) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct Prober {
    state: StateStore,
    substrate: Arc<dyn Substrate>,
    probe_timeout: Duration,
    callback: Option<ProbeCallback>,
}

pub struct LivenessMonitor {
    prober: Prober,
    interval: Duration,
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl LivenessMonitor {
    pub fn new(state: StateStore, substrate: Arc<dyn Substrate>, interval: Duration) -> Self {
        Self {
            prober: Prober {
                state,
                substrate,
                probe_timeout: Duration::from_secs(5),
                callback: None,
            },
            interval,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_callback(mut self, callback: ProbeCallback) -> Self {
        self.prober.callback = Some(callback);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.prober.probe_timeout = timeout;
        self
    }

    /// Start probing a workload's members. Restarts an existing monitor.
    pub async fn start_monitor(&self, workload: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = self.prober.clone();
        let interval = self.interval;
        let name = workload.to_string();

        let handle = tokio::spawn(async move {
            run_liveness_loop(&name, prober, interval, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            workload.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(%workload, ?interval, "liveness monitor started");
    }

    pub async fn stop_monitor(&self, workload: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(workload) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%workload, "liveness monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (workload, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%workload, "liveness monitor stopped");
        }
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.monitors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_monitoring(&self, workload: &str) -> bool {
        self.monitors.read().await.contains_key(workload)
    }

    /// Probe every Running member of a workload once.
    pub async fn probe_once(&self, workload: &str) -> Vec<(MemberId, ProbeResult)> {
        self.prober.probe_workload(workload).await
    }
}

impl Prober {
    async fn probe_workload(&self, workload: &str) -> Vec<(MemberId, ProbeResult)> {
        let members = match self.state.list_members(workload) {
            Ok(members) => members,
            Err(e) => {
                error!(%workload, error = %e, "failed to list members for liveness probe");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for member in members.into_iter().filter(|m| m.is_running()) {
            let Some(handle_id) = member.handle.clone() else {
                continue;
            };
            let handle = MemberHandle {
                id: handle_id,
                address: member.address.clone(),
            };
            let result = tokio::time::timeout(self.probe_timeout, self.substrate.probe(&handle))
                .await
                .unwrap_or(ProbeResult::Failed);

            if let Some(cb) = &self.callback {
                cb(workload.to_string(), member.id.clone(), result).await;
            }
            results.push((member.id, result));
        }
        results
    }
}

async fn run_liveness_loop(
    workload: &str,
    prober: Prober,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%workload, "liveness loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                prober.probe_workload(workload).await;
            }
            _ = shutdown.changed() => {
                debug!(%workload, "liveness loop shutting down");
                break;
            }
        }
    }
}
