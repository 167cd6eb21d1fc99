//! topo-state — resource store for topo.
//!
//! Backed by [redb](https://docs.rs/redb), holds the desired state
//! operators submit (workloads, services, ingress rules) and the observed
//! state the controllers maintain (members, volumes, statuses).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-workload records use `{workload}:{suffix}` keys so one prefix scan
//! returns a workload's members or volumes in ordinal order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Desired-state changes are
//! broadcast as [`StoreEvent`]s.

pub mod document;
pub mod error;
pub mod manifest;
pub mod store;
pub mod tables;
pub mod types;
pub mod validate;

pub use document::{ApplyOutcome, Document, DocumentKey, DocumentKind, StoreEvent};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
