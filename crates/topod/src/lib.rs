//! topod — the topo daemon.
//!
//! Single binary that assembles every topo subsystem:
//! - Resource store (redb)
//! - Compute substrate and secret store
//! - Service registry + ingress router
//! - Reconciler (stateful and replica controllers, liveness monitor)
//! - Target discovery feed
//! - REST API
//!
//! # Usage
//!
//! ```text
//! topod standalone --port 8443 --data-dir /var/lib/topo --manifests ./deploy
//! topod validate ./deploy
//! ```

pub mod standalone;
pub mod validate;

pub use standalone::Stack;
pub use validate::{ValidationReport, validate_manifests};
