//! StateStore — redb-backed resource store for topo.
//!
//! Holds desired state (workloads, services, ingress rules) and observed
//! state (members, volumes, reconciliation status). All values are
//! JSON-serialized into redb's `&[u8]` value columns. Desired state enters
//! through [`StateStore::apply`], which validates every document before
//! writing and broadcasts a [`StoreEvent`] for each accepted change.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::document::{ApplyOutcome, Document, StoreEvent};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::validate;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const EVENT_CAPACITY: usize = 256;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn lookup<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every value whose key starts with `prefix`, in key order.
fn scan<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

fn workload_prefix(workload: &str) -> String {
    format!("{workload}:")
}

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [WORKLOADS, MEMBERS, VOLUMES, SERVICES, INGRESS, STATUS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to desired-state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine; the periodic resync covers missed events.
        let _ = self.events.send(event);
    }

    // ── Generic table access ───────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        lookup(&table, key)
    }

    fn list<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan(&table, prefix)
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn remove_prefix(&self, def: JsonTable, prefix: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(prefix) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            count = keys.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Apply ──────────────────────────────────────────────────────

    /// Validate and store one desired-state document.
    ///
    /// Re-applying an identical document is a no-op: it returns
    /// `Unchanged`, writes nothing and emits no event.
    pub fn apply(&self, doc: &Document) -> StateResult<ApplyOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (outcome, event) = match doc {
            Document::Workload(spec) => (
                apply_workload(&txn, spec)?,
                StoreEvent::WorkloadApplied(spec.name.clone()),
            ),
            Document::Service(svc) => (
                apply_service(&txn, svc)?,
                StoreEvent::ServiceApplied(svc.name.clone()),
            ),
            Document::Ingress(rule) => (
                apply_ingress(&txn, rule)?,
                StoreEvent::IngressApplied(rule.name.clone()),
            ),
        };

        if outcome == ApplyOutcome::Unchanged {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(document = %doc.key(), "apply unchanged");
            return Ok(outcome);
        }

        txn.commit().map_err(map_err!(Transaction))?;
        info!(document = %doc.key(), ?outcome, "document applied");
        self.emit(event);
        Ok(outcome)
    }

    /// Apply a batch in dependency order (workloads, then services, then
    /// ingress rules). Stops at the first invalid document; documents
    /// applied before it stay applied.
    pub fn apply_all(&self, docs: &[Document]) -> StateResult<Vec<(Document, ApplyOutcome)>> {
        let mut ordered: Vec<&Document> = docs.iter().collect();
        ordered.sort_by_key(|doc| doc.key().kind);

        let mut results = Vec::with_capacity(ordered.len());
        for doc in ordered {
            let outcome = self.apply(doc)?;
            results.push((doc.clone(), outcome));
        }
        Ok(results)
    }

    // ── Workloads ──────────────────────────────────────────────────

    pub fn get_workload(&self, name: &str) -> StateResult<Option<WorkloadSpec>> {
        self.get(WORKLOADS, name)
    }

    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadSpec>> {
        self.list(WORKLOADS, "")
    }

    /// Delete a workload spec. Members, volumes and services are torn down
    /// by the reconciler in response to the emitted event.
    pub fn delete_workload(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(WORKLOADS, name)?;
        if existed {
            info!(workload = %name, "workload deleted");
            self.emit(StoreEvent::WorkloadDeleted(name.to_string()));
        }
        Ok(existed)
    }

    // ── Members ────────────────────────────────────────────────────

    pub fn put_member(&self, member: &Member) -> StateResult<()> {
        self.put(MEMBERS, &member.table_key(), member)
    }

    pub fn get_member(&self, workload: &str, id: &MemberId) -> StateResult<Option<Member>> {
        self.get(MEMBERS, &member_key(workload, id))
    }

    /// Members of one workload, ordinals ascending.
    pub fn list_members(&self, workload: &str) -> StateResult<Vec<Member>> {
        self.list(MEMBERS, &workload_prefix(workload))
    }

    pub fn list_all_members(&self) -> StateResult<Vec<Member>> {
        self.list(MEMBERS, "")
    }

    pub fn delete_member(&self, workload: &str, id: &MemberId) -> StateResult<bool> {
        self.remove(MEMBERS, &member_key(workload, id))
    }

    pub fn delete_members_for_workload(&self, workload: &str) -> StateResult<u32> {
        self.remove_prefix(MEMBERS, &workload_prefix(workload))
    }

    // ── Volumes ────────────────────────────────────────────────────

    pub fn put_volume(&self, volume: &Volume) -> StateResult<()> {
        self.put(VOLUMES, &volume.table_key(), volume)
    }

    pub fn get_volume(&self, workload: &str, ordinal: u32) -> StateResult<Option<Volume>> {
        self.get(VOLUMES, &volume_key(workload, ordinal))
    }

    pub fn list_volumes(&self, workload: &str) -> StateResult<Vec<Volume>> {
        self.list(VOLUMES, &workload_prefix(workload))
    }

    pub fn list_all_volumes(&self) -> StateResult<Vec<Volume>> {
        self.list(VOLUMES, "")
    }

    pub fn delete_volume(&self, workload: &str, ordinal: u32) -> StateResult<bool> {
        self.remove(VOLUMES, &volume_key(workload, ordinal))
    }

    /// Mark every volume of a workload `Released`. Returns the number changed.
    pub fn release_volumes_for_workload(&self, workload: &str) -> StateResult<u32> {
        let now = epoch_secs();
        let mut released = 0;
        for mut volume in self.list_volumes(workload)? {
            if volume.state != VolumeState::Released {
                volume.state = VolumeState::Released;
                volume.updated_at = now;
                self.put_volume(&volume)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Released volumes of a workload, i.e. the ones eligible for purge.
    pub fn released_volumes(&self, workload: &str) -> StateResult<Vec<Volume>> {
        Ok(self
            .list_volumes(workload)?
            .into_iter()
            .filter(|v| v.state == VolumeState::Released)
            .collect())
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceRecord>> {
        self.get(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.list(SERVICES, "")
    }

    pub fn list_services_for_workload(&self, workload: &str) -> StateResult<Vec<ServiceRecord>> {
        Ok(self
            .list_services()?
            .into_iter()
            .filter(|s| s.workload == workload)
            .collect())
    }

    /// Delete a service record. Refused while an ingress rule points at it.
    pub fn delete_service(&self, name: &str) -> StateResult<bool> {
        if let Some(rule) = self.list_ingress()?.into_iter().find(|r| r.service == name) {
            return Err(StateError::Invalid(format!(
                "service {name} is referenced by ingress rule {}",
                rule.name
            )));
        }
        let existed = self.remove(SERVICES, name)?;
        if existed {
            info!(service = %name, "service deleted");
            self.emit(StoreEvent::ServiceDeleted(name.to_string()));
        }
        Ok(existed)
    }

    /// Delete every service fronting a workload (workload teardown). Ingress
    /// rules pointing at them are kept and route to an empty service.
    pub fn delete_services_for_workload(&self, workload: &str) -> StateResult<Vec<String>> {
        let mut deleted = Vec::new();
        for svc in self.list_services_for_workload(workload)? {
            if self.remove(SERVICES, &svc.name)? {
                self.emit(StoreEvent::ServiceDeleted(svc.name.clone()));
                deleted.push(svc.name);
            }
        }
        if !deleted.is_empty() {
            info!(%workload, services = ?deleted, "services deleted with workload");
        }
        Ok(deleted)
    }

    // ── Ingress ────────────────────────────────────────────────────

    pub fn get_ingress(&self, name: &str) -> StateResult<Option<IngressRule>> {
        self.get(INGRESS, name)
    }

    /// Ingress rules in registration order.
    pub fn list_ingress(&self) -> StateResult<Vec<IngressRule>> {
        let mut rules: Vec<IngressRule> = self.list(INGRESS, "")?;
        rules.sort_by_key(|r| r.seq);
        Ok(rules)
    }

    pub fn delete_ingress(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(INGRESS, name)?;
        if existed {
            info!(ingress = %name, "ingress rule deleted");
            self.emit(StoreEvent::IngressDeleted(name.to_string()));
        }
        Ok(existed)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn put_status(&self, status: &WorkloadStatus) -> StateResult<()> {
        self.put(STATUS, &status.workload, status)
    }

    pub fn get_status(&self, workload: &str) -> StateResult<Option<WorkloadStatus>> {
        self.get(STATUS, workload)
    }

    pub fn list_statuses(&self) -> StateResult<Vec<WorkloadStatus>> {
        self.list(STATUS, "")
    }

    pub fn delete_status(&self, workload: &str) -> StateResult<bool> {
        self.remove(STATUS, workload)
    }
}

// ── Apply helpers (run inside one write transaction) ───────────────

fn apply_workload(txn: &WriteTransaction, spec: &WorkloadSpec) -> StateResult<ApplyOutcome> {
    validate::validate_workload(spec)?;

    let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
    let previous: Option<WorkloadSpec> = lookup(&table, &spec.name)?;

    let mut stored = spec.clone();
    let outcome = match previous {
        None => {
            stored.generation = 1;
            ApplyOutcome::Created
        }
        Some(prev) => {
            validate::validate_workload_update(spec, &prev)?;
            if spec.same_desired_state(&prev) {
                return Ok(ApplyOutcome::Unchanged);
            }
            stored.generation = prev.generation + 1;
            ApplyOutcome::Updated
        }
    };

    let bytes = encode(&stored)?;
    table
        .insert(stored.name.as_str(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(outcome)
}

fn apply_service(txn: &WriteTransaction, svc: &ServiceRecord) -> StateResult<ApplyOutcome> {
    let target: Option<WorkloadSpec> = {
        let workloads = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        lookup(&workloads, &svc.workload)?
    };
    validate::validate_service(svc, target.as_ref())?;

    let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
    let previous: Option<ServiceRecord> = lookup(&table, &svc.name)?;
    let outcome = match previous {
        None => ApplyOutcome::Created,
        Some(prev) if prev == *svc => return Ok(ApplyOutcome::Unchanged),
        Some(_) => ApplyOutcome::Updated,
    };

    let bytes = encode(svc)?;
    table
        .insert(svc.name.as_str(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(outcome)
}

fn apply_ingress(txn: &WriteTransaction, rule: &IngressRule) -> StateResult<ApplyOutcome> {
    let service_exists = {
        let services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        services.get(rule.service.as_str()).map_err(map_err!(Read))?.is_some()
    };
    validate::validate_ingress(rule, service_exists)?;

    let mut table = txn.open_table(INGRESS).map_err(map_err!(Table))?;
    let existing: Vec<IngressRule> = scan(&table, "")?;

    let mut stored = rule.clone();
    let outcome = match existing.iter().find(|r| r.name == rule.name) {
        Some(prev) if rule.same_desired_state(prev) => return Ok(ApplyOutcome::Unchanged),
        Some(prev) => {
            stored.seq = prev.seq;
            ApplyOutcome::Updated
        }
        None => {
            stored.seq = existing.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
            ApplyOutcome::Created
        }
    };

    let bytes = encode(&stored)?;
    table
        .insert(stored.name.as_str(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(outcome)
}
