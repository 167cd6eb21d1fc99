//! topo-scheduler — workload controllers and the reconciliation loop.
//!
//! Maps `WorkloadSpec`s (from `topo-state`) to members on a compute
//! substrate (from `topo-runtime`). The scheduler:
//!
//! - Gives stateful members stable ordinals, addresses and volumes
//! - Scales stateless instances and rolls them to new revisions within
//!   the unavailability bound
//! - Persists member, volume and status records to the state store
//! - Publishes member changes to the service registry
//!
//! # Architecture
//!
//! ```text
//! Reconciler
//!   ├── StateStore (read WorkloadSpec, write Member / Volume / Status)
//!   ├── Per-workload worker (serialized passes)
//!   │   ├── WorkloadController::plan   (pure: observed → actions)
//!   │   └── WorkloadController::execute
//!   │       └── Executor ── Substrate (bounded calls, retry + backoff)
//!   └── ProxySync (registry updates after every member change)
//! ```

pub mod action;
pub mod cancel;
pub mod controller;
pub mod error;
pub mod executor;
pub mod reconciler;
pub mod replica;
pub mod stateful;

pub use action::{Action, VolumeBinding};
pub use cancel::Cancel;
pub use controller::{Observed, WorkloadController};
pub use error::{ControllerError, ControllerResult};
pub use executor::Executor;
pub use reconciler::{PassOutcome, Reconciler, Trigger};
pub use replica::ReplicaController;
pub use stateful::StatefulController;
