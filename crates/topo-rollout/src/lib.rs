//! topo-rollout — rolling updates for stateless workloads.
//!
//! # Components
//!
//! - **`revision`** — Revision hash of the image + environment of a spec
//! - **`strategy`** — Rolling update bounds (`max_unavailable`)
//! - **`controller`** — Step planner: scale, remove surplus, or replace
//!   out-of-date instances within the bound

pub mod controller;
pub mod revision;
pub mod strategy;

pub use controller::{RolloutPhase, RolloutStep, plan_step, surplus_order};
pub use revision::revision_hash;
pub use strategy::RollingConfig;
