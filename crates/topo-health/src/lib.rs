//! topo-health — liveness tracking and retry policy for topo.
//!
//! # Architecture
//!
//! ```text
//! LivenessMonitor
//!   ├── Per-workload background task
//!   │   ├── Substrate::probe() for every Running member
//!   │   └── ProbeCallback → ServiceRegistry::record_probe
//!   └── HealthTracker per member (owned by the registry)
//!       └── consecutive failure / success thresholds
//! ```
//!
//! [`Backoff`] computes the bounded exponential delay between member
//! creation retries.

pub mod backoff;
pub mod monitor;
pub mod tracker;

pub use backoff::Backoff;
pub use monitor::{BoxFuture, LivenessMonitor, ProbeCallback};
pub use tracker::{HealthStatus, HealthTracker};
