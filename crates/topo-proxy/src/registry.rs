//! Service registry — resolves service names to eligible member addresses.
//!
//! A member is *eligible* when it is `Running` and its liveness tracker is
//! healthy. Headless services resolve to every eligible member address in
//! ordinal order; load-balanced services resolve to one stable virtual
//! address while at least one member is eligible, and [`ServiceRegistry::pick`]
//! spreads connections over the eligible set.
//!
//! Locking is per entity: the outer maps are only held long enough to
//! clone an `Arc` to the workload or service entry. Every change publishes
//! a fresh [`RegistrySnapshot`] on a `watch` channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use topo_core::config::RegistryConfig;
use topo_health::{HealthStatus, HealthTracker};
use topo_runtime::ProbeResult;
use topo_state::{Member, MemberId, ServiceMode, ServiceRecord};

use crate::balancer::RoundRobinBalancer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {0} not found")]
    ServiceNotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Address of a member: `{workload}-{ordinal}.{workload}.{domain}` for
/// stateful members, `{instance}.{workload}.{domain}` for stateless ones.
pub fn member_address(workload: &str, id: &MemberId, domain: &str) -> String {
    match id {
        MemberId::Ordinal(n) => format!("{workload}-{n}.{workload}.{domain}"),
        MemberId::Instance(instance) => format!("{instance}.{workload}.{domain}"),
    }
}

/// Stable virtual address of a load-balanced service.
pub fn virtual_address(service: &str, domain: &str) -> String {
    format!("{service}.{domain}")
}

/// One eligible member behind a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub member: MemberId,
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub mode: ServiceMode,
    pub workload: String,
    pub external_port: u16,
    pub target_port: u16,
    /// What `resolve` returns.
    pub addresses: Vec<String>,
    pub endpoints: Vec<Endpoint>,
}

/// Immutable copy of the whole registry, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub version: u64,
    /// Sorted by service name.
    pub services: Vec<ServiceView>,
}

impl RegistrySnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceView> {
        self.services.iter().find(|s| s.name == name)
    }
}

struct TrackedMember {
    member: Member,
    tracker: HealthTracker,
}

#[derive(Default)]
struct WorkloadEntry {
    /// Sorted by member id.
    members: Vec<TrackedMember>,
}

impl WorkloadEntry {
    fn eligible(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|t| t.member.is_running() && t.tracker.is_healthy())
            .map(|t| &t.member)
    }
}

struct ServiceEntry {
    record: ServiceRecord,
    balancer: RoundRobinBalancer,
}

pub struct ServiceRegistry {
    domain: String,
    failure_threshold: u32,
    success_threshold: u32,
    workloads: RwLock<HashMap<String, Arc<RwLock<WorkloadEntry>>>>,
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    /// Last published version. Held while a snapshot is built and sent,
    /// so versions and contents advance together.
    version: Mutex<u64>,
    snapshot_tx: watch::Sender<Arc<RegistrySnapshot>>,
}

impl ServiceRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        Self {
            domain: config.domain.clone(),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            workloads: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            version: Mutex::new(0),
            snapshot_tx,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn workload_entry(&self, workload: &str) -> Option<Arc<RwLock<WorkloadEntry>>> {
        self.workloads
            .read()
            .expect("workloads lock")
            .get(workload)
            .cloned()
    }

    fn service_entry(&self, service: &str) -> RegistryResult<Arc<ServiceEntry>> {
        self.services
            .read()
            .expect("services lock")
            .get(service)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Replace the member set of a workload. Liveness history is kept for
    /// members whose substrate handle is unchanged.
    pub fn update(&self, workload: &str, mut members: Vec<Member>) {
        members.sort_by(|a, b| a.id.cmp(&b.id));

        let entry = {
            let mut workloads = self.workloads.write().expect("workloads lock");
            workloads.entry(workload.to_string()).or_default().clone()
        };
        {
            let mut entry = entry.write().expect("workload entry lock");
            let mut previous: HashMap<MemberId, TrackedMember> = entry
                .members
                .drain(..)
                .map(|t| (t.member.id.clone(), t))
                .collect();

            entry.members = members
                .into_iter()
                .map(|member| {
                    let tracker = match previous.remove(&member.id) {
                        Some(old) if old.member.handle == member.handle => old.tracker,
                        _ => self.new_tracker(),
                    };
                    TrackedMember { member, tracker }
                })
                .collect();

            debug!(
                %workload,
                members = entry.members.len(),
                eligible = entry.eligible().count(),
                "registry members updated"
            );
        }
        self.publish();
    }

    pub fn register_service(&self, record: ServiceRecord) {
        let name = record.name.clone();
        {
            let mut services = self.services.write().expect("services lock");
            let unchanged = services.get(&name).is_some_and(|e| e.record == record);
            if unchanged {
                return;
            }
            info!(service = %name, mode = ?record.mode, workload = %record.workload, "service registered");
            services.insert(
                name,
                Arc::new(ServiceEntry {
                    record,
                    balancer: RoundRobinBalancer::new(),
                }),
            );
        }
        self.publish();
    }

    pub fn remove_service(&self, service: &str) -> bool {
        let removed = self
            .services
            .write()
            .expect("services lock")
            .remove(service)
            .is_some();
        if removed {
            info!(%service, "service removed from registry");
            self.publish();
        }
        removed
    }

    /// Drop a workload's endpoint set (workload teardown).
    pub fn remove_workload(&self, workload: &str) -> bool {
        let removed = self
            .workloads
            .write()
            .expect("workloads lock")
            .remove(workload)
            .is_some();
        if removed {
            debug!(%workload, "workload removed from registry");
            self.publish();
        }
        removed
    }

    /// Feed a liveness probe result into a member's tracker. Returns the
    /// member's resulting status, or `None` if the member is unknown.
    pub fn record_probe(
        &self,
        workload: &str,
        member: &MemberId,
        result: ProbeResult,
    ) -> Option<HealthStatus> {
        let entry = self.workload_entry(workload)?;
        let (before, after) = {
            let mut entry = entry.write().expect("workload entry lock");
            let tracked = entry.members.iter_mut().find(|t| &t.member.id == member)?;
            let before = tracked.tracker.status();
            (before, tracked.tracker.record(result))
        };

        if before != after {
            match after {
                HealthStatus::Unhealthy => {
                    info!(%workload, %member, "member excluded from service resolution")
                }
                HealthStatus::Healthy => {
                    info!(%workload, %member, "member restored to service resolution")
                }
            }
            self.publish();
        }
        Some(after)
    }

    fn new_tracker(&self) -> HealthTracker {
        HealthTracker::new(self.failure_threshold, self.success_threshold)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .expect("services lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn service(&self, service: &str) -> RegistryResult<ServiceRecord> {
        Ok(self.service_entry(service)?.record.clone())
    }

    /// Running, liveness-healthy members of a workload, in id order.
    pub fn eligible_members(&self, workload: &str) -> Vec<Member> {
        match self.workload_entry(workload) {
            Some(entry) => entry
                .read()
                .expect("workload entry lock")
                .eligible()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Members currently excluded by liveness.
    pub fn excluded_members(&self, workload: &str) -> Vec<MemberId> {
        self.members_where(workload, |t| !t.tracker.is_healthy())
    }

    /// Members excluded by liveness for at least `older_than`.
    pub fn stale_excluded(&self, workload: &str, older_than: Duration) -> Vec<MemberId> {
        self.members_where(workload, |t| {
            t.tracker.unhealthy_for().is_some_and(|d| d >= older_than)
        })
    }

    fn members_where(&self, workload: &str, pred: impl Fn(&TrackedMember) -> bool) -> Vec<MemberId> {
        match self.workload_entry(workload) {
            Some(entry) => entry
                .read()
                .expect("workload entry lock")
                .members
                .iter()
                .filter(|t| pred(t))
                .map(|t| t.member.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Eligible endpoints behind a service, regardless of mode.
    pub fn endpoints(&self, service: &str) -> RegistryResult<Vec<Endpoint>> {
        let entry = self.service_entry(service)?;
        Ok(self.endpoints_for(&entry.record))
    }

    fn endpoints_for(&self, record: &ServiceRecord) -> Vec<Endpoint> {
        self.eligible_members(&record.workload)
            .into_iter()
            .map(|m| Endpoint {
                member: m.id,
                address: m.address,
                port: record.target_port,
            })
            .collect()
    }

    /// Addresses a client sees for `service`.
    pub fn resolve(&self, service: &str) -> RegistryResult<Vec<String>> {
        let entry = self.service_entry(service)?;
        Ok(self.resolve_record(&entry.record))
    }

    fn resolve_record(&self, record: &ServiceRecord) -> Vec<String> {
        let eligible = self.eligible_members(&record.workload);
        match record.mode {
            ServiceMode::Headless => eligible.into_iter().map(|m| m.address).collect(),
            ServiceMode::LoadBalanced if eligible.is_empty() => Vec::new(),
            ServiceMode::LoadBalanced => vec![virtual_address(&record.name, &self.domain)],
        }
    }

    /// Next endpoint for a connection to `service` (round-robin).
    pub fn pick(&self, service: &str) -> RegistryResult<Option<Endpoint>> {
        let entry = self.service_entry(service)?;
        let endpoints = self.endpoints_for(&entry.record);
        Ok(entry
            .balancer
            .next(endpoints.len())
            .map(|idx| endpoints[idx].clone()))
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive a new snapshot after every registry change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        let mut version = self.version.lock().expect("version lock");
        let records: Vec<ServiceRecord> = {
            let services = self.services.read().expect("services lock");
            services.values().map(|e| e.record.clone()).collect()
        };

        let mut views: Vec<ServiceView> = records
            .into_iter()
            .map(|record| ServiceView {
                addresses: self.resolve_record(&record),
                endpoints: self.endpoints_for(&record),
                name: record.name,
                mode: record.mode,
                workload: record.workload,
                external_port: record.external_port,
                target_port: record.target_port,
            })
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));

        *version += 1;
        self.snapshot_tx.send_replace(Arc::new(RegistrySnapshot {
            version: *version,
            services: views,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topo_state::MemberPhase;

    const DOMAIN: &str = "topo.local";

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(&RegistryConfig::default())
    }

    fn member(workload: &str, id: MemberId, phase: MemberPhase) -> Member {
        Member {
            workload: workload.to_string(),
            address: member_address(workload, &id, DOMAIN),
            handle: Some(format!("h-{id}")),
            id,
            phase,
            revision: "r1".to_string(),
            volume_id: None,
            attempts: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn db_members(phases: &[MemberPhase]) -> Vec<Member> {
        phases
            .iter()
            .enumerate()
            .map(|(i, p)| member("db", MemberId::Ordinal(i as u32), *p))
            .collect()
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

    #[test]
    fn addresses_are_deterministic() {
        assert_eq!(
            member_address("db", &MemberId::Ordinal(2), DOMAIN),
            "db-2.db.topo.local"
        );
        assert_eq!(
            member_address("web", &MemberId::Instance("web-1a2b3c-0".into()), DOMAIN),
            "web-1a2b3c-0.web.topo.local"
        );
        assert_eq!(virtual_address("web-svc", DOMAIN), "web-svc.topo.local");
    }

    #[test]
    fn headless_resolves_running_members_in_ordinal_order() {
        let reg = registry();
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));

        let mut members = db_members(&[
            MemberPhase::Running,
            MemberPhase::Pending,
            MemberPhase::Running,
        ]);
        members.reverse();
        reg.update("db", members);

        assert_eq!(
            reg.resolve("db").unwrap(),
            vec!["db-0.db.topo.local", "db-2.db.topo.local"]
        );
    }

    #[test]
    fn load_balanced_resolves_to_virtual_address() {
        let reg = registry();
        reg.register_service(service("web-svc", ServiceMode::LoadBalanced, "web", 3000));
        assert!(reg.resolve("web-svc").unwrap().is_empty());

        reg.update(
            "web",
            vec![member("web", MemberId::Instance("web-a".into()), MemberPhase::Running)],
        );
        assert_eq!(reg.resolve("web-svc").unwrap(), vec!["web-svc.topo.local"]);
    }

    #[test]
    fn unknown_service_is_an_error() {
        let reg = registry();
        assert_eq!(
            reg.resolve("nope"),
            Err(RegistryError::ServiceNotFound("nope".to_string()))
        );
    }

    #[test]
    fn pick_round_robins_over_eligible_members() {
        let reg = registry();
        reg.register_service(service("web-svc", ServiceMode::LoadBalanced, "web", 3000));
        reg.update(
            "web",
            vec![
                member("web", MemberId::Instance("web-a".into()), MemberPhase::Running),
                member("web", MemberId::Instance("web-b".into()), MemberPhase::Running),
                member("web", MemberId::Instance("web-c".into()), MemberPhase::Terminating),
            ],
        );

        let picks: Vec<String> = (0..4)
            .map(|_| reg.pick("web-svc").unwrap().unwrap().endpoint())
            .collect();
        assert_eq!(
            picks,
            vec![
                "web-a.web.topo.local:3000",
                "web-b.web.topo.local:3000",
                "web-a.web.topo.local:3000",
                "web-b.web.topo.local:3000",
            ]
        );
    }

    #[test]
    fn exclusion_after_three_failures_and_return_after_three_successes() {
        let reg = registry();
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));
        reg.update("db", db_members(&[MemberPhase::Running, MemberPhase::Running]));
        let m1 = MemberId::Ordinal(1);

        reg.record_probe("db", &m1, ProbeResult::Failed);
        reg.record_probe("db", &m1, ProbeResult::Failed);
        assert_eq!(reg.resolve("db").unwrap().len(), 2);

        assert_eq!(
            reg.record_probe("db", &m1, ProbeResult::Failed),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(reg.resolve("db").unwrap(), vec!["db-0.db.topo.local"]);
        assert_eq!(reg.excluded_members("db"), vec![m1.clone()]);

        reg.record_probe("db", &m1, ProbeResult::Healthy);
        reg.record_probe("db", &m1, ProbeResult::Healthy);
        assert_eq!(reg.resolve("db").unwrap().len(), 1);
        reg.record_probe("db", &m1, ProbeResult::Healthy);
        assert_eq!(reg.resolve("db").unwrap().len(), 2);
    }

    #[test]
    fn update_keeps_history_only_for_same_handle() {
        let reg = registry();
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));
        reg.update("db", db_members(&[MemberPhase::Running]));
        for _ in 0..3 {
            reg.record_probe("db", &MemberId::Ordinal(0), ProbeResult::Failed);
        }

        // Same handle: still excluded.
        reg.update("db", db_members(&[MemberPhase::Running]));
        assert!(reg.resolve("db").unwrap().is_empty());

        // Recreated member gets a fresh tracker.
        let mut recreated = db_members(&[MemberPhase::Running]);
        recreated[0].handle = Some("h-new".to_string());
        reg.update("db", recreated);
        assert_eq!(reg.resolve("db").unwrap().len(), 1);
    }

    #[test]
    fn record_probe_for_unknown_member_is_ignored() {
        let reg = registry();
        assert_eq!(reg.record_probe("db", &MemberId::Ordinal(0), ProbeResult::Failed), None);
    }

    #[test]
    fn snapshots_are_published_on_change() {
        let reg = registry();
        let mut rx = reg.subscribe();
        assert_eq!(rx.borrow_and_update().version, 0);

        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));
        reg.update("db", db_members(&[MemberPhase::Running]));
        assert!(rx.has_changed().unwrap());

        let snap = reg.snapshot();
        assert_eq!(snap.version, 2);
        let view = snap.service("db").unwrap();
        assert_eq!(view.addresses, vec!["db-0.db.topo.local"]);
        assert_eq!(view.endpoints[0].endpoint(), "db-0.db.topo.local:27017");

        // Re-registering an identical record publishes nothing.
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));
        assert_eq!(reg.snapshot().version, 2);
    }

    #[test]
    fn concurrent_publishers_keep_snapshot_in_step() {
        let reg = Arc::new(registry());
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let phase = if (i + round) % 2 == 0 {
                            MemberPhase::Running
                        } else {
                            MemberPhase::Terminating
                        };
                        reg.update("db", db_members(&[phase, MemberPhase::Running]));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let snap = reg.snapshot();
        assert_eq!(snap.version, 1 + 8 * 50);
        assert_eq!(snap.service("db").unwrap().addresses, reg.resolve("db").unwrap());
    }

    #[test]
    fn remove_workload_empties_resolution() {
        let reg = registry();
        reg.register_service(service("db", ServiceMode::Headless, "db", 27017));
        reg.update("db", db_members(&[MemberPhase::Running]));
        assert!(reg.remove_workload("db"));
        assert!(reg.resolve("db").unwrap().is_empty());
        assert!(reg.remove_service("db"));
        assert!(reg.list_services().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_exclusions_are_reported_after_threshold() {
        let reg = registry();
        reg.update("db", db_members(&[MemberPhase::Running]));
        for _ in 0..3 {
            reg.record_probe("db", &MemberId::Ordinal(0), ProbeResult::Failed);
        }
        assert!(reg.stale_excluded("db", Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            reg.stale_excluded("db", Duration::from_secs(60)),
            vec![MemberId::Ordinal(0)]
        );
    }
}
