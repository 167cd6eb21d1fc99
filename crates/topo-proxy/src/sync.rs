//! Proxy state synchronization — bridges the resource store to the
//! service registry and ingress router.
//!
//! `ProxySync::sync` is a full rebuild used at startup and on every
//! periodic resync; the `on_*` methods apply single changes as the
//! reconciler and store events report them.
//!
//! Member sets are always read from the store and pushed to the registry
//! under one lock, so a slow reader can never overwrite a newer set.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use topo_state::{StateError, StateStore, StoreEvent};

use crate::ingress::IngressRouter;
use crate::registry::ServiceRegistry;

#[derive(Clone)]
pub struct ProxySync {
    registry: Arc<ServiceRegistry>,
    ingress: Arc<IngressRouter>,
    members_lock: Arc<Mutex<()>>,
}

/// Sync statistics.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub services_synced: u32,
    pub services_removed: u32,
    pub members_total: u32,
    pub ingress_rules: u32,
}

impl ProxySync {
    pub fn new(registry: Arc<ServiceRegistry>, ingress: Arc<IngressRouter>) -> Self {
        Self {
            registry,
            ingress,
            members_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn ingress(&self) -> &Arc<IngressRouter> {
        &self.ingress
    }

    /// Full rebuild from the store. Services and workloads no longer in the
    /// store are dropped.
    pub fn sync(&self, store: &StateStore) -> Result<SyncStats, StateError> {
        let mut stats = SyncStats::default();

        let services = store.list_services()?;
        for stale in self.registry.list_services() {
            if !services.iter().any(|s| s.name == stale) {
                self.registry.remove_service(&stale);
                stats.services_removed += 1;
            }
        }
        for svc in services {
            self.registry.register_service(svc);
            stats.services_synced += 1;
        }

        for spec in store.list_workloads()? {
            stats.members_total += self.refresh_members(store, &spec.name)? as u32;
        }

        let rules = store.list_ingress()?;
        stats.ingress_rules = rules.len() as u32;
        self.ingress.replace_rules(rules);

        info!(
            services = stats.services_synced,
            members = stats.members_total,
            removed = stats.services_removed,
            ingress = stats.ingress_rules,
            "proxy sync complete"
        );
        Ok(stats)
    }

    /// Push a workload's stored member set to the registry. Returns the
    /// number of members.
    pub fn refresh_members(&self, store: &StateStore, workload: &str) -> Result<usize, StateError> {
        let _guard = self.members_lock.lock().expect("members lock");
        let members = store.list_members(workload)?;
        let count = members.len();
        self.registry.update(workload, members);
        Ok(count)
    }

    /// A workload was torn down.
    pub fn on_workload_removed(&self, workload: &str) {
        let _guard = self.members_lock.lock().expect("members lock");
        self.registry.remove_workload(workload);
        debug!(%workload, "workload removed from proxy");
    }

    /// Apply a desired-state change to services or ingress rules.
    /// Workload events are handled by the reconciler.
    pub fn on_event(&self, store: &StateStore, event: &StoreEvent) -> Result<(), StateError> {
        match event {
            StoreEvent::ServiceApplied(name) => {
                if let Some(svc) = store.get_service(name)? {
                    self.registry.register_service(svc);
                }
            }
            StoreEvent::ServiceDeleted(name) => {
                self.registry.remove_service(name);
            }
            StoreEvent::IngressApplied(name) => {
                if let Some(rule) = store.get_ingress(name)? {
                    self.ingress.upsert(rule);
                }
            }
            StoreEvent::IngressDeleted(name) => {
                self.ingress.remove(name);
            }
            StoreEvent::WorkloadApplied(_) | StoreEvent::WorkloadDeleted(_) => {}
        }
        Ok(())
    }
}
