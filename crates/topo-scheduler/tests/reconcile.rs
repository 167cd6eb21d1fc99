//! Reconciliation integration tests.
//!
//! Every test drives the real controllers against an in-memory store and
//! the simulated substrate, with tokio's clock paused so readiness
//! timeouts and backoff delays elapse instantly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use topo_core::config::TopoConfig;
use topo_proxy::{IngressRouter, ProxySync, ServiceRegistry};
use topo_runtime::{ProbeResult, SimOp, SimSubstrate, StaticSecretStore};
use topo_scheduler::{Action, Reconciler};
use topo_state::*;

// ── Harness ────────────────────────────────────────────────────────

fn test_config() -> TopoConfig {
    let mut config = TopoConfig::default();
    config.members.ready_timeout = Duration::from_secs(5);
    config.members.probe_interval = Duration::from_millis(100);
    config.members.op_timeout = Duration::from_secs(1);
    config.members.terminate_grace = Duration::from_secs(1);
    config.members.retry_ceiling = 3;
    config.members.backoff_base = Duration::from_millis(100);
    config.members.backoff_max = Duration::from_secs(1);
    config.registry.unhealthy_replace_after = Duration::ZERO;
    config
}

struct Harness {
    store: StateStore,
    sim: Arc<SimSubstrate>,
    registry: Arc<ServiceRegistry>,
    proxy: ProxySync,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with(SimSubstrate::new(), StaticSecretStore::new(), test_config())
    }

    fn with(sim: SimSubstrate, secrets: StaticSecretStore, config: TopoConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(sim);
        let registry = Arc::new(ServiceRegistry::new(&config.registry));
        let proxy = ProxySync::new(registry.clone(), Arc::new(IngressRouter::new()));
        let reconciler = Reconciler::new(
            store.clone(),
            sim.clone(),
            Arc::new(secrets),
            proxy.clone(),
            &config,
        );
        Self {
            store,
            sim,
            registry,
            proxy,
            reconciler,
        }
    }

    fn apply(&self, docs: Vec<Document>) {
        self.store.apply_all(&docs).unwrap();
        self.proxy.sync(&self.store).unwrap();
    }

    async fn reconcile(&self, workload: &str) -> (WorkloadPhase, u32) {
        let outcome = self.reconciler.reconcile_once(workload).await.unwrap();
        (outcome.phase, outcome.actions)
    }

    fn creates(&self, workload: &str) -> Vec<(MemberId, String, Option<String>)> {
        self.sim
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::Create {
                    workload: w,
                    member,
                    revision,
                    volume_id,
                } if w == workload => Some((member, revision, volume_id)),
                _ => None,
            })
            .collect()
    }

    fn terminations(&self, workload: &str) -> Vec<MemberId> {
        self.sim
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::Terminate { workload: w, member } if w == workload => Some(member),
                _ => None,
            })
            .collect()
    }
}

fn stateful(name: &str, replicas: u32) -> WorkloadSpec {
    WorkloadSpec {
        name: name.to_string(),
        kind: WorkloadKind::Stateful,
        replicas,
        image: "mongo:7".to_string(),
        ports: BTreeSet::from([27017]),
        env: BTreeMap::new(),
        volume: Some(VolumeRequest {
            size_bytes: 10 << 30,
        }),
        max_unavailable: None,
        metrics: None,
        generation: 0,
    }
}

fn stateless(name: &str, replicas: u32, image: &str) -> WorkloadSpec {
    WorkloadSpec {
        name: name.to_string(),
        kind: WorkloadKind::Stateless,
        replicas,
        image: image.to_string(),
        ports: BTreeSet::from([3000]),
        env: BTreeMap::new(),
        volume: None,
        max_unavailable: None,
        metrics: None,
        generation: 0,
    }
}

fn service(name: &str, mode: ServiceMode, workload: &str, port: u16) -> ServiceRecord {
    ServiceRecord {
        name: name.to_string(),
        mode,
        workload: workload.to_string(),
        external_port: port,
        target_port: port,
    }
}

fn ordinals(ids: &[MemberId]) -> Vec<u32> {
    ids.iter().filter_map(MemberId::ordinal).collect()
}

// ── Stateful ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_a_ordered_bring_up_and_headless_resolution() {
    let h = Harness::new();
    h.apply(vec![
        Document::Workload(stateful("mongodb", 3)),
        Document::Service(service("mongodb", ServiceMode::Headless, "mongodb", 27017)),
    ]);

    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 3));

    let created: Vec<MemberId> = h.creates("mongodb").into_iter().map(|c| c.0).collect();
    assert_eq!(ordinals(&created), vec![0, 1, 2]);
    // One member in flight at a time.
    assert!(h.sim.samples("mongodb").iter().all(|(_, not_ready)| *not_ready <= 1));

    assert_eq!(
        h.registry.resolve("mongodb").unwrap(),
        vec![
            "mongodb-0.mongodb.topo.local",
            "mongodb-1.mongodb.topo.local",
            "mongodb-2.mongodb.topo.local",
        ]
    );

    let volumes = h.store.list_volumes("mongodb").unwrap();
    assert_eq!(volumes.len(), 3);
    assert!(volumes.iter().all(|v| v.state == VolumeState::Bound));
    assert_eq!(volumes[2].id, "data-mongodb-2");

    let status = h.store.get_status("mongodb").unwrap().unwrap();
    assert_eq!(status.phase, WorkloadPhase::Stable);
    assert_eq!(status.observed_generation, 1);
}

#[tokio::test(start_paused = true)]
async fn stable_workload_yields_no_actions() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateful("mongodb", 2))]);
    h.reconcile("mongodb").await;
    let ops_before = h.sim.ops().len();

    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 0));
    assert!(h.reconciler.plan("mongodb").unwrap().is_empty());
    assert_eq!(h.sim.ops().len(), ops_before);
}

#[tokio::test(start_paused = true)]
async fn scale_down_and_up_keeps_ordinals_dense_and_volumes_bound() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateful("mongodb", 3))]);
    h.reconcile("mongodb").await;

    h.apply(vec![Document::Workload(stateful("mongodb", 1))]);
    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 2));
    assert_eq!(ordinals(&h.terminations("mongodb")), vec![2, 1]);
    assert_eq!(h.sim.live_members("mongodb"), vec![MemberId::Ordinal(0)]);

    let states: Vec<VolumeState> = h
        .store
        .list_volumes("mongodb")
        .unwrap()
        .iter()
        .map(|v| v.state)
        .collect();
    assert_eq!(
        states,
        vec![VolumeState::Bound, VolumeState::Released, VolumeState::Released]
    );

    h.apply(vec![Document::Workload(stateful("mongodb", 3))]);
    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 2));
    let rebound: Vec<(u32, Option<String>)> = h
        .creates("mongodb")
        .into_iter()
        .skip(3)
        .map(|(m, _, v)| (m.ordinal().unwrap(), v))
        .collect();
    assert_eq!(
        rebound,
        vec![
            (1, Some("data-mongodb-1".to_string())),
            (2, Some("data-mongodb-2".to_string())),
        ]
    );
    // No new volume was provisioned for the returning ordinals.
    let provisioned = h
        .sim
        .ops()
        .iter()
        .filter(|op| matches!(op, SimOp::ProvisionVolume { .. }))
        .count();
    assert_eq!(provisioned, 3);
    assert!(
        h.store
            .list_volumes("mongodb")
            .unwrap()
            .iter()
            .all(|v| v.state == VolumeState::Bound)
    );
}

#[tokio::test(start_paused = true)]
async fn purge_deletes_only_released_volumes() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateful("mongodb", 3))]);
    h.reconcile("mongodb").await;
    h.apply(vec![Document::Workload(stateful("mongodb", 1))]);
    h.reconcile("mongodb").await;

    assert_eq!(h.reconciler.purge_volumes("mongodb").await.unwrap(), 2);
    assert_eq!(h.sim.volumes(), vec!["data-mongodb-0".to_string()]);
    assert_eq!(h.store.list_volumes("mongodb").unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stateful_upgrade_replaces_highest_ordinal_first() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateful("mongodb", 3))]);
    h.reconcile("mongodb").await;

    let mut upgraded = stateful("mongodb", 3);
    upgraded.image = "mongo:8".to_string();
    h.apply(vec![Document::Workload(upgraded)]);
    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 3));

    assert_eq!(ordinals(&h.terminations("mongodb")), vec![2, 1, 0]);
    let recreated: Vec<(u32, Option<String>)> = h
        .creates("mongodb")
        .into_iter()
        .skip(3)
        .map(|(m, _, v)| (m.ordinal().unwrap(), v))
        .collect();
    assert_eq!(
        recreated,
        vec![
            (2, Some("data-mongodb-2".to_string())),
            (1, Some("data-mongodb-1".to_string())),
            (0, Some("data-mongodb-0".to_string())),
        ]
    );
    assert_eq!(h.sim.live_images("mongodb"), vec!["mongo:8"; 3]);
}

#[tokio::test(start_paused = true)]
async fn excluded_member_is_recreated_after_grace() {
    let h = Harness::new();
    h.apply(vec![
        Document::Workload(stateful("mongodb", 2)),
        Document::Service(service("mongodb", ServiceMode::Headless, "mongodb", 27017)),
    ]);
    h.reconcile("mongodb").await;

    let one = MemberId::Ordinal(1);
    for _ in 0..3 {
        h.registry.record_probe("mongodb", &one, ProbeResult::Failed);
    }
    assert_eq!(h.registry.excluded_members("mongodb"), vec![one.clone()]);
    assert_eq!(h.registry.resolve("mongodb").unwrap().len(), 1);

    assert_eq!(h.reconcile("mongodb").await, (WorkloadPhase::Stable, 1));
    assert_eq!(h.terminations("mongodb"), vec![one.clone()]);
    assert!(h.registry.excluded_members("mongodb").is_empty());
    assert_eq!(h.registry.resolve("mongodb").unwrap().len(), 2);
}

// ── Stateless ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_b_rolling_update_keeps_one_instance_running() {
    let h = Harness::new();
    h.apply(vec![
        Document::Workload(stateless("nodejs-app", 2, "nodejs-app:v1")),
        Document::Service(service(
            "nodejs-app-service",
            ServiceMode::LoadBalanced,
            "nodejs-app",
            3000,
        )),
    ]);
    assert_eq!(h.reconcile("nodejs-app").await, (WorkloadPhase::Stable, 2));
    let baseline = h.sim.samples("nodejs-app").len();

    for image in ["nodejs-app:v2", "nodejs-app:v3"] {
        h.apply(vec![Document::Workload(stateless("nodejs-app", 2, image))]);
        let (phase, actions) = h.reconcile("nodejs-app").await;
        assert_eq!(phase, WorkloadPhase::Stable);
        assert_eq!(actions, 2);
        assert_eq!(h.sim.live_images("nodejs-app"), vec![image; 2]);
        assert_eq!(
            h.registry.resolve("nodejs-app-service").unwrap(),
            vec!["nodejs-app-service.topo.local"]
        );
    }

    let during = &h.sim.samples("nodejs-app")[baseline..];
    assert!(!during.is_empty());
    for (ready, not_ready) in during {
        assert!(*ready >= 1, "ready count dropped to zero");
        assert!(*not_ready <= 1, "more than one instance unavailable");
    }
}

#[tokio::test(start_paused = true)]
async fn rolling_update_respects_wider_bound() {
    let h = Harness::new();
    let mut spec = stateless("web", 4, "web:v1");
    spec.max_unavailable = Some(2);
    h.apply(vec![Document::Workload(spec.clone())]);
    h.reconcile("web").await;
    let baseline = h.sim.samples("web").len();

    spec.image = "web:v2".to_string();
    h.apply(vec![Document::Workload(spec)]);
    assert_eq!(h.reconcile("web").await.0, WorkloadPhase::Stable);

    for (ready, not_ready) in &h.sim.samples("web")[baseline..] {
        assert!(*ready >= 2);
        assert!(*not_ready <= 2);
    }
    assert_eq!(h.sim.live_images("web"), vec!["web:v2"; 4]);
}

#[tokio::test(start_paused = true)]
async fn scale_down_prefers_newest_instances() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateless("web", 3, "web:v1"))]);
    h.reconcile("web").await;

    h.apply(vec![Document::Workload(stateless("web", 1, "web:v1"))]);
    assert_eq!(h.reconcile("web").await, (WorkloadPhase::Stable, 2));
    assert_eq!(h.sim.live_members("web").len(), 1);
    assert_eq!(h.store.list_members("web").unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_create_failures_are_retried() {
    let h = Harness::new();
    h.sim.fail_next_creates("web", 2);
    h.apply(vec![Document::Workload(stateless("web", 1, "web:v1"))]);

    assert_eq!(h.reconcile("web").await, (WorkloadPhase::Stable, 1));
    let members = h.store.list_members("web").unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].phase, MemberPhase::Running);
    assert_eq!(members[0].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_replacement_keeps_previous_set() {
    let h = Harness::new();
    h.apply(vec![
        Document::Workload(stateless("web", 2, "web:v1")),
        Document::Service(service("web", ServiceMode::LoadBalanced, "web", 3000)),
    ]);
    h.reconcile("web").await;

    h.sim.set_never_ready("web:v2");
    h.apply(vec![Document::Workload(stateless("web", 2, "web:v2"))]);
    let (phase, _) = h.reconcile("web").await;
    assert_eq!(phase, WorkloadPhase::Degraded);

    assert_eq!(h.sim.live_images("web"), vec!["web:v1"; 2]);
    let members = h.store.list_members("web").unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.is_running()));
    assert_eq!(h.registry.resolve("web").unwrap(), vec!["web.topo.local"]);

    let status = h.store.get_status("web").unwrap().unwrap();
    assert_eq!(status.phase, WorkloadPhase::Degraded);
    assert!(status.message.unwrap().contains("creation attempts"));
}

// ── Isolation & errors ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn retry_ceiling_degrades_only_the_failing_workload() {
    let h = Harness::new();
    h.sim.set_never_ready("broken:v1");
    h.apply(vec![
        Document::Workload(stateless("broken", 1, "broken:v1")),
        Document::Workload(stateless("healthy", 1, "healthy:v1")),
    ]);

    assert_eq!(h.reconcile("broken").await.0, WorkloadPhase::Degraded);
    assert_eq!(h.reconcile("healthy").await.0, WorkloadPhase::Stable);

    let broken = h.store.list_members("broken").unwrap();
    assert_eq!(broken[0].phase, MemberPhase::Failed);
    assert_eq!(broken[0].attempts, 3);
    assert!(h.sim.live_members("broken").is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_image_degrades_without_retrying() {
    let h = Harness::new();
    h.sim.reject_image("bad:v1");
    h.apply(vec![Document::Workload(stateless("web", 1, "bad:v1"))]);

    let outcome = h.reconciler.reconcile_once("web").await.unwrap();
    assert_eq!(outcome.phase, WorkloadPhase::Degraded);
    assert!(outcome.message.unwrap().contains("cannot be pulled"));
    assert_eq!(h.store.list_members("web").unwrap()[0].attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn secrets_are_resolved_but_never_stored() {
    let secrets = StaticSecretStore::new().with("app", "session", "s3cr3t-value");
    let h = Harness::with(SimSubstrate::new(), secrets, test_config());

    let mut spec = stateless("web", 1, "web:v1");
    spec.env.insert(
        "SESSION_SECRET".to_string(),
        EnvValue::Secret {
            secret_ref: SecretRef {
                name: "app".to_string(),
                key: "session".to_string(),
            },
        },
    );
    h.apply(vec![Document::Workload(spec)]);
    assert_eq!(h.reconcile("web").await.0, WorkloadPhase::Stable);

    let stored = format!(
        "{:?}{:?}",
        h.store.list_members("web").unwrap(),
        h.store.get_status("web").unwrap()
    );
    assert!(!stored.contains("s3cr3t-value"));
}

#[tokio::test(start_paused = true)]
async fn missing_secret_degrades_after_retries() {
    let h = Harness::new();
    let mut spec = stateless("web", 1, "web:v1");
    spec.env.insert(
        "DB_PASSWORD".to_string(),
        EnvValue::Secret {
            secret_ref: SecretRef {
                name: "db".to_string(),
                key: "password".to_string(),
            },
        },
    );
    h.apply(vec![Document::Workload(spec)]);

    assert_eq!(h.reconcile("web").await.0, WorkloadPhase::Degraded);
    assert!(h.creates("web").is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_workload_is_reported() {
    let h = Harness::new();
    assert!(matches!(
        h.reconciler.reconcile_once("ghost").await,
        Err(topo_scheduler::ControllerError::WorkloadNotFound(_))
    ));
    assert!(h.reconciler.retry("ghost").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn plan_previews_next_step() {
    let h = Harness::new();
    h.apply(vec![Document::Workload(stateful("mongodb", 2))]);
    let plan = h.reconciler.plan("mongodb").unwrap();
    assert_eq!(plan.len(), 1);
    assert!(matches!(
        &plan[0],
        Action::Create { member: MemberId::Ordinal(0), volume: Some(_) }
    ));
}

// ── Teardown & worker loop ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn teardown_terminates_highest_first_and_retains_volumes() {
    let h = Harness::new();
    h.apply(vec![
        Document::Workload(stateful("mongodb", 2)),
        Document::Service(service("mongodb", ServiceMode::Headless, "mongodb", 27017)),
    ]);
    h.reconcile("mongodb").await;

    h.store.delete_workload("mongodb").unwrap();
    assert_eq!(h.reconciler.teardown("mongodb").await.unwrap(), 2);

    assert_eq!(ordinals(&h.terminations("mongodb")), vec![1, 0]);
    assert!(h.sim.live_members("mongodb").is_empty());
    assert!(h.store.list_members("mongodb").unwrap().is_empty());
    assert!(h.store.get_service("mongodb").unwrap().is_none());
    assert!(h.store.get_status("mongodb").unwrap().is_none());
    assert!(h.registry.resolve("mongodb").is_err());
    assert!(
        h.store
            .list_volumes("mongodb")
            .unwrap()
            .iter()
            .all(|v| v.state == VolumeState::Released)
    );
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn worker_loop_reacts_to_store_events() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = h.reconciler.start(shutdown_rx);

    h.apply(vec![
        Document::Workload(stateless("web", 2, "web:v1")),
        Document::Service(service("web", ServiceMode::LoadBalanced, "web", 3000)),
    ]);
    let store = h.store.clone();
    wait_until(|| {
        store
            .get_status("web")
            .unwrap()
            .is_some_and(|s| s.phase == WorkloadPhase::Stable && s.observed_generation == 1)
    })
    .await;
    assert_eq!(h.sim.live_members("web").len(), 2);
    assert_eq!(h.reconciler.workers().await, vec!["web".to_string()]);

    h.store.delete_workload("web").unwrap();
    let sim = h.sim.clone();
    wait_until(|| sim.live_members("web").is_empty()).await;
    wait_until(|| store.get_service("web").unwrap().is_none()).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert!(h.reconciler.workers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_terminations_are_not_repeated_by_resync() {
    let mut config = test_config();
    config.reconcile.interval = Duration::from_secs(1);
    config.members.terminate_grace = Duration::from_secs(10);
    let h = Harness::with(SimSubstrate::new(), StaticSecretStore::new(), config);
    h.sim.set_terminate_delay(Duration::from_secs(5));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = h.reconciler.start(shutdown_rx);

    h.apply(vec![Document::Workload(stateless("web", 1, "web:v1"))]);
    let store = h.store.clone();
    wait_until(|| {
        store
            .get_status("web")
            .unwrap()
            .is_some_and(|s| s.phase == WorkloadPhase::Stable)
    })
    .await;

    h.store.delete_workload("web").unwrap();
    let sim = h.sim.clone();
    wait_until(|| sim.live_members("web").is_empty()).await;
    wait_until(|| store.list_members("web").unwrap().is_empty()).await;
    // Several more ticks after the teardown finished.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.terminations("web").len(), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deleting_mid_creation_stops_further_creations() {
    let h = Harness::with(
        SimSubstrate::with_ready_after(20),
        StaticSecretStore::new(),
        test_config(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = h.reconciler.start(shutdown_rx);

    h.apply(vec![Document::Workload(stateful("mongodb", 3))]);
    let sim = h.sim.clone();
    wait_until(|| !sim.live_members("mongodb").is_empty()).await;

    h.store.delete_workload("mongodb").unwrap();
    let store = h.store.clone();
    wait_until(|| sim.live_members("mongodb").is_empty()).await;
    wait_until(|| store.list_members("mongodb").unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.creates("mongodb").len(), 1);
    assert_eq!(h.terminations("mongodb"), vec![MemberId::Ordinal(0)]);
    assert!(sim.live_members("mongodb").is_empty());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn operator_retry_leaves_degraded() {
    let h = Harness::new();
    h.sim.fail_next_creates("web", 3);
    h.apply(vec![Document::Workload(stateless("web", 1, "web:v1"))]);
    assert_eq!(h.reconcile("web").await.0, WorkloadPhase::Degraded);

    h.reconciler.retry("web").await.unwrap();
    let store = h.store.clone();
    wait_until(|| {
        store
            .get_status("web")
            .unwrap()
            .is_some_and(|s| s.phase == WorkloadPhase::Stable)
    })
    .await;
    assert_eq!(h.sim.live_members("web").len(), 1);
    assert_eq!(h.store.list_members("web").unwrap()[0].attempts, 0);

    h.reconciler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn degraded_workload_retries_after_interval() {
    let mut config = test_config();
    config.reconcile.interval = Duration::from_secs(1);
    config.reconcile.degraded_retry = Duration::from_secs(5);
    let h = Harness::with(SimSubstrate::new(), StaticSecretStore::new(), config);
    h.sim.fail_next_creates("web", 3);
    // Applied before start so only ticks drive the worker.
    h.apply(vec![Document::Workload(stateless("web", 1, "web:v1"))]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = h.reconciler.start(shutdown_rx);

    let store = h.store.clone();
    wait_until(|| {
        store
            .get_status("web")
            .unwrap()
            .is_some_and(|s| s.phase == WorkloadPhase::Degraded)
    })
    .await;
    let degraded_at = tokio::time::Instant::now();

    wait_until(|| {
        store
            .get_status("web")
            .unwrap()
            .is_some_and(|s| s.phase == WorkloadPhase::Stable)
    })
    .await;
    assert!(degraded_at.elapsed() >= Duration::from_secs(4));
    assert_eq!(h.sim.live_members("web").len(), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}
