//! topo-proxy — service registry and ingress routing for topo.
//!
//! # Components
//!
//! - **`registry`** — Service name resolution (headless and load-balanced)
//!   with liveness-based exclusion
//! - **`ingress`** — Host + path-prefix routing of external requests
//! - **`balancer`** — Round-robin selection for load-balanced services
//! - **`sync`** — Store → registry/router synchronization

pub mod balancer;
pub mod ingress;
pub mod registry;
pub mod sync;

pub use balancer::RoundRobinBalancer;
pub use ingress::{IngressRouter, Route, RouteError};
pub use registry::{
    Endpoint, RegistryError, RegistryResult, RegistrySnapshot, ServiceRegistry, ServiceView,
    member_address, virtual_address,
};
pub use sync::{ProxySync, SyncStats};
