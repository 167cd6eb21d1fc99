//! Reconciliation loop — one worker task per workload.
//!
//! The `Reconciler` owns a worker per workload, fed by triggers from the
//! periodic tick, store change events and operator retries. A worker runs
//! one pass at a time: observe → plan → execute until the plan is empty
//! (Stable) or an error stops it (Degraded, or still Reconciling for
//! transient errors). Workers never share state, so one workload's failure
//! cannot stall another.
//!
//! # Architecture
//!
//! ```text
//! Reconciler
//!   ├── StateStore events  ──► WorkloadApplied → worker trigger
//!   │                          WorkloadDeleted → cancel + teardown
//!   │                          Service/Ingress → ProxySync
//!   ├── Ticker             ──► resync + Tick to every worker
//!   ├── Per-workload worker
//!   │   ├── StatefulController  (ordinals, volumes)
//!   │   └── ReplicaController   (instances, rolling updates)
//!   └── LivenessMonitor    ──► ServiceRegistry::record_probe
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use topo_core::config::{ReconcileConfig, TopoConfig};
use topo_health::{BoxFuture, LivenessMonitor, ProbeCallback};
use topo_proxy::ProxySync;
use topo_rollout::revision_hash;
use topo_runtime::{ProbeResult, SecretStore, Substrate};
use topo_state::{
    MemberId, MemberPhase, StateStore, StoreEvent, WorkloadKind, WorkloadPhase, WorkloadSpec,
    WorkloadStatus, epoch_secs,
};

use crate::action::Action;
use crate::cancel::Cancel;
use crate::controller::{Observed, WorkloadController};
use crate::error::{ControllerError, ControllerResult};
use crate::executor::Executor;
use crate::replica::ReplicaController;
use crate::stateful::StatefulController;

const TRIGGER_QUEUE: usize = 16;

/// Why a worker should run a pass. Ordered by precedence when coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Trigger {
    Tick,
    Changed,
    Retry,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    pub workload: String,
    pub phase: WorkloadPhase,
    pub actions: u32,
    pub message: Option<String>,
}

struct WorkerSlot {
    tx: mpsc::Sender<Trigger>,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    state: StateStore,
    executor: Executor,
    stateful: StatefulController,
    replica: ReplicaController,
    monitor: LivenessMonitor,
    config: ReconcileConfig,
    replace_unhealthy_after: Duration,
    workers: Mutex<HashMap<String, WorkerSlot>>,
    /// Workloads with a teardown in flight.
    tearing_down: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        state: StateStore,
        substrate: Arc<dyn Substrate>,
        secrets: Arc<dyn SecretStore>,
        proxy: ProxySync,
        config: &TopoConfig,
    ) -> Self {
        let executor = Executor::new(
            state.clone(),
            substrate.clone(),
            secrets,
            proxy.clone(),
            config.members.clone(),
        );

        let registry = proxy.registry().clone();
        let callback: ProbeCallback = Arc::new(
            move |workload: String, member: MemberId, result: ProbeResult| -> BoxFuture {
                let registry = registry.clone();
                Box::pin(async move {
                    registry.record_probe(&workload, &member, result);
                })
            },
        );
        let monitor = LivenessMonitor::new(
            state.clone(),
            substrate,
            config.registry.liveness_interval,
        )
        .with_probe_timeout(config.members.op_timeout)
        .with_callback(callback);

        Self {
            inner: Arc::new(Inner {
                state,
                stateful: StatefulController::new(executor.clone()),
                replica: ReplicaController::new(executor.clone(), config.rollout.max_unavailable),
                executor,
                monitor,
                config: config.reconcile.clone(),
                replace_unhealthy_after: config.registry.unhealthy_replace_after,
                workers: Mutex::new(HashMap::new()),
                tearing_down: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn proxy(&self) -> &ProxySync {
        self.inner.executor.proxy()
    }

    fn controller(&self, kind: WorkloadKind) -> &dyn WorkloadController {
        match kind {
            WorkloadKind::Stateful => &self.inner.stateful,
            WorkloadKind::Stateless => &self.inner.replica,
        }
    }

    // ── Main loop ──────────────────────────────────────────────────

    /// Run the reconciler until `shutdown` flips. The first tick fires
    /// immediately and spawns a worker for every stored workload.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        let mut events = self.inner.state.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?this.inner.config.interval, "reconciler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.resync().await;
                        this.tick_all().await;
                    }
                    event = events.recv() => match event {
                        Ok(event) => this.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "store events lagged, resyncing");
                            this.resync().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
            this.shutdown().await;
        })
    }

    async fn handle_event(&self, event: StoreEvent) {
        match &event {
            StoreEvent::WorkloadApplied(name) => {
                self.ensure_worker(name).await;
                self.trigger(name, Trigger::Changed).await;
            }
            StoreEvent::WorkloadDeleted(name) => {
                let this = self.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.teardown(&name).await {
                        error!(workload = %name, error = %e, "teardown failed");
                    }
                });
            }
            _ => {
                if let Err(e) = self.proxy().on_event(&self.inner.state, &event) {
                    error!(?event, error = %e, "failed to apply store event to proxy");
                }
            }
        }
    }

    /// Rebuild the proxy view and make the worker set match the store.
    /// Leftovers of workloads that no longer exist are torn down.
    pub async fn resync(&self) {
        if let Err(e) = self.proxy().sync(&self.inner.state) {
            error!(error = %e, "proxy resync failed");
        }

        let specs = match self.inner.state.list_workloads() {
            Ok(specs) => specs,
            Err(e) => {
                error!(error = %e, "failed to list workloads");
                return;
            }
        };
        let names: BTreeSet<String> = specs.into_iter().map(|s| s.name).collect();
        for name in &names {
            self.ensure_worker(name).await;
        }

        let mut orphans: BTreeSet<String> = self.workers().await.into_iter().collect();
        if let Ok(members) = self.inner.state.list_all_members() {
            orphans.extend(members.into_iter().map(|m| m.workload));
        }
        let tearing_down = self.inner.tearing_down.lock().await.clone();
        for orphan in orphans
            .difference(&names)
            .filter(|name| !tearing_down.contains(*name))
        {
            let this = self.clone();
            let name = orphan.clone();
            tokio::spawn(async move {
                if let Err(e) = this.teardown(&name).await {
                    error!(workload = %name, error = %e, "orphan teardown failed");
                }
            });
        }
    }

    async fn tick_all(&self) {
        let workers = self.inner.workers.lock().await;
        for (name, slot) in workers.iter() {
            if slot.tx.try_send(Trigger::Tick).is_err() {
                debug!(workload = %name, "worker busy, tick skipped");
            }
        }
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Spawn a worker for `name` unless one is running. Returns true if a
    /// worker was spawned.
    pub async fn ensure_worker(&self, name: &str) -> bool {
        {
            let mut workers = self.inner.workers.lock().await;
            if workers.contains_key(name) {
                return false;
            }

            let status = self.inner.state.get_status(name).ok().flatten();
            let degraded_at = status
                .as_ref()
                .filter(|s| s.phase == WorkloadPhase::Degraded)
                .map(|_| Instant::now());
            if status.is_none() {
                if let Ok(Some(spec)) = self.inner.state.get_workload(name) {
                    let _ = self.write_status(&spec, WorkloadPhase::Idle, None, 0);
                }
            }

            let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
            let (cancel_tx, cancel) = Cancel::new();
            let this = self.clone();
            let worker_name = name.to_string();
            let handle = tokio::spawn(async move {
                this.run_worker(worker_name, rx, cancel, degraded_at).await;
            });
            let _ = tx.try_send(Trigger::Tick);
            workers.insert(
                name.to_string(),
                WorkerSlot {
                    tx,
                    cancel_tx,
                    handle,
                },
            );
        }
        self.inner.monitor.start_monitor(name).await;
        info!(workload = %name, "workload worker started");
        true
    }

    /// Queue a trigger without waiting. A full queue already holds a pass
    /// that will observe the latest spec.
    async fn trigger(&self, name: &str, trigger: Trigger) -> bool {
        match self.inner.workers.lock().await.get(name) {
            Some(slot) => slot.tx.try_send(trigger).is_ok(),
            None => false,
        }
    }

    pub async fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel a worker and wait for it to stop. In-flight terminations
    /// finish; no new member is created after the cancel is observed.
    async fn stop_worker(&self, name: &str) {
        let slot = self.inner.workers.lock().await.remove(name);
        if let Some(slot) = slot {
            let _ = slot.cancel_tx.send(true);
            drop(slot.tx);
            if let Err(e) = slot.handle.await {
                warn!(workload = %name, error = %e, "worker ended abnormally");
            }
            debug!(workload = %name, "worker stopped");
        }
        self.inner.monitor.stop_monitor(name).await;
    }

    /// Stop every worker and liveness monitor.
    pub async fn shutdown(&self) {
        let names = self.workers().await;
        for name in names {
            self.stop_worker(&name).await;
        }
        self.inner.monitor.stop_all().await;
    }

    async fn run_worker(
        self,
        name: String,
        mut rx: mpsc::Receiver<Trigger>,
        cancel: Cancel,
        mut degraded_at: Option<Instant>,
    ) {
        debug!(workload = %name, "worker loop starting");
        loop {
            let mut trigger = tokio::select! {
                next = rx.recv() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            while let Ok(queued) = rx.try_recv() {
                trigger = trigger.max(queued);
            }

            if trigger == Trigger::Tick {
                if let Some(since) = degraded_at {
                    if since.elapsed() < self.inner.config.degraded_retry {
                        continue;
                    }
                }
            }
            if degraded_at.take().is_some() || trigger != Trigger::Tick {
                if let Err(e) = self.reset_attempts(&name) {
                    warn!(workload = %name, error = %e, "failed to reset retry counters");
                }
            }

            match self.pass(&name, &cancel).await {
                Ok(outcome) => {
                    if outcome.phase == WorkloadPhase::Degraded {
                        degraded_at = Some(Instant::now());
                    }
                }
                Err(ControllerError::Cancelled(_)) => break,
                Err(ControllerError::WorkloadNotFound(_)) => {
                    debug!(workload = %name, "workload gone, waiting for teardown");
                }
                Err(e) => error!(workload = %name, error = %e, "reconciliation pass failed"),
            }
        }
        debug!(workload = %name, "worker loop exited");
    }

    // ── Passes ─────────────────────────────────────────────────────

    /// Run one pass for `name` outside the worker. Callers must not run
    /// this concurrently with the workload's own worker.
    pub async fn reconcile_once(&self, name: &str) -> ControllerResult<PassOutcome> {
        self.pass(name, &Cancel::never()).await
    }

    /// The actions the next step of a pass would take, without executing.
    pub fn plan(&self, name: &str) -> ControllerResult<Vec<Action>> {
        let spec = self
            .inner
            .state
            .get_workload(name)?
            .ok_or_else(|| ControllerError::WorkloadNotFound(name.to_string()))?;
        let observed = self.observe(&spec, &revision_hash(&spec))?;
        Ok(self.controller(spec.kind).plan(&spec, &observed))
    }

    async fn pass(&self, name: &str, cancel: &Cancel) -> ControllerResult<PassOutcome> {
        let spec = self
            .inner
            .state
            .get_workload(name)?
            .ok_or_else(|| ControllerError::WorkloadNotFound(name.to_string()))?;
        self.write_status(&spec, WorkloadPhase::Reconciling, None, 0)?;

        let (phase, actions, message) = match self.converge(&spec, cancel).await {
            Ok(actions) => {
                if actions > 0 {
                    info!(workload = %name, actions, generation = spec.generation, "workload stable");
                } else {
                    debug!(workload = %name, "workload already stable");
                }
                (WorkloadPhase::Stable, actions, None)
            }
            Err(ControllerError::Cancelled(w)) => return Err(ControllerError::Cancelled(w)),
            Err(e) if e.is_degrading() => {
                warn!(workload = %name, error = %e, "workload degraded");
                (WorkloadPhase::Degraded, 0, Some(e.to_string()))
            }
            Err(e) => {
                warn!(workload = %name, error = %e, "pass interrupted, will retry");
                (WorkloadPhase::Reconciling, 0, Some(e.to_string()))
            }
        };

        self.write_status(&spec, phase, message.clone(), actions)?;
        Ok(PassOutcome {
            workload: name.to_string(),
            phase,
            actions,
            message,
        })
    }

    async fn converge(&self, spec: &WorkloadSpec, cancel: &Cancel) -> ControllerResult<u32> {
        self.replace_unhealthy(spec)?;

        let controller = self.controller(spec.kind);
        let revision = revision_hash(spec);
        let mut total = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled(spec.name.clone()));
            }
            let observed = self.observe(spec, &revision)?;
            let actions = controller.plan(spec, &observed);
            if actions.is_empty() {
                break;
            }
            total += controller.execute(spec, actions, cancel).await?;
        }
        self.inner.executor.publish(&spec.name)?;
        Ok(total)
    }

    fn observe(&self, spec: &WorkloadSpec, revision: &str) -> ControllerResult<Observed> {
        let volumes = if spec.is_stateful() {
            self.inner.state.list_volumes(&spec.name)?
        } else {
            Vec::new()
        };
        Ok(Observed {
            members: self.inner.state.list_members(&spec.name)?,
            volumes,
            revision: revision.to_string(),
        })
    }

    /// Mark Failed every Running member the registry has excluded for longer
    /// than `unhealthy_replace_after`; the plan then recreates it.
    fn replace_unhealthy(&self, spec: &WorkloadSpec) -> ControllerResult<()> {
        let stale = self
            .proxy()
            .registry()
            .stale_excluded(&spec.name, self.inner.replace_unhealthy_after);
        for id in stale {
            if let Some(mut member) = self.inner.state.get_member(&spec.name, &id)? {
                if member.is_running() {
                    warn!(workload = %spec.name, member = %id, "replacing unhealthy member");
                    member.phase = MemberPhase::Failed;
                    member.updated_at = epoch_secs();
                    self.inner.state.put_member(&member)?;
                }
            }
        }
        Ok(())
    }

    fn reset_attempts(&self, name: &str) -> ControllerResult<()> {
        for mut member in self.inner.state.list_members(name)? {
            if member.attempts > 0 {
                member.attempts = 0;
                self.inner.state.put_member(&member)?;
            }
        }
        Ok(())
    }

    fn write_status(
        &self,
        spec: &WorkloadSpec,
        phase: WorkloadPhase,
        message: Option<String>,
        last_actions: u32,
    ) -> ControllerResult<()> {
        self.inner.state.put_status(&WorkloadStatus {
            workload: spec.name.clone(),
            phase,
            message,
            observed_generation: spec.generation,
            last_actions,
            updated_at: epoch_secs(),
        })?;
        Ok(())
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Clear a workload's failure counters and reconcile it now.
    pub async fn retry(&self, name: &str) -> ControllerResult<()> {
        if self.inner.state.get_workload(name)?.is_none() {
            return Err(ControllerError::WorkloadNotFound(name.to_string()));
        }
        self.reset_attempts(name)?;
        self.ensure_worker(name).await;
        if !self.trigger(name, Trigger::Retry).await {
            debug!(workload = %name, "worker queue full, retry folded into pending pass");
        }
        info!(workload = %name, "retry requested");
        Ok(())
    }

    /// Tear down everything a deleted workload left behind: members
    /// (highest ordinal first), volume bindings (kept as Released),
    /// dependent services, registry entries and status.
    ///
    /// At most one teardown runs per workload; a call made while one is in
    /// flight returns `Ok(0)` immediately.
    pub async fn teardown(&self, name: &str) -> ControllerResult<u32> {
        if !self.inner.tearing_down.lock().await.insert(name.to_string()) {
            debug!(workload = %name, "teardown already in progress");
            return Ok(0);
        }
        let result = self.teardown_members(name).await;
        self.inner.tearing_down.lock().await.remove(name);
        result
    }

    async fn teardown_members(&self, name: &str) -> ControllerResult<u32> {
        self.stop_worker(name).await;

        let mut members = self.inner.state.list_members(name)?;
        members.sort_by(|a, b| b.id.cmp(&a.id));

        let mut terminated = 0;
        let mut failure = None;
        for member in members {
            match self
                .inner
                .executor
                .terminate_member(name, &member.id, false)
                .await
            {
                Ok(()) => terminated += 1,
                Err(e) => {
                    warn!(workload = %name, member = %member.id, error = %e, "teardown termination failed");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let released = self.inner.state.release_volumes_for_workload(name)?;
        let services = self.inner.state.delete_services_for_workload(name)?;
        for service in &services {
            self.proxy().registry().remove_service(service);
        }
        self.proxy().on_workload_removed(name);
        self.inner.state.delete_status(name)?;

        info!(
            workload = %name,
            members = terminated,
            volumes_released = released,
            services_removed = services.len(),
            "workload torn down"
        );
        Ok(terminated)
    }

    /// Destroy Released volumes of a workload. Bound volumes are untouched.
    pub async fn purge_volumes(&self, workload: &str) -> ControllerResult<u32> {
        let mut purged = 0;
        for volume in self.inner.state.released_volumes(workload)? {
            self.inner.executor.delete_volume(&volume).await?;
            purged += 1;
        }
        Ok(purged)
    }
}
