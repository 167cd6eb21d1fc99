//! redb table definitions for the topo resource store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Per-workload tables use `{workload}:{suffix}` keys so a prefix scan
//! returns one workload's records.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Workload specs keyed by `{name}`.
pub const WORKLOADS: JsonTable = TableDefinition::new("workloads");

/// Members keyed by `{workload}:{ordinal:05}` or `{workload}:{instance_id}`.
pub const MEMBERS: JsonTable = TableDefinition::new("members");

/// Volumes keyed by `{workload}:{ordinal:05}`.
pub const VOLUMES: JsonTable = TableDefinition::new("volumes");

/// Service records keyed by `{name}`.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Ingress rules keyed by `{name}`.
pub const INGRESS: JsonTable = TableDefinition::new("ingress");

/// Reconciliation status keyed by `{workload}`.
pub const STATUS: JsonTable = TableDefinition::new("status");
