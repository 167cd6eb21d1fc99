//! topo-metrics — observability for topo workloads.
//!
//! Derives scrape targets for an external metrics collector from the
//! service registry, renders them as Prometheus HTTP service discovery,
//! and exposes reconciliation status in the Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryFeed
//!   ├── current()   ← pull: one ScrapeTarget per eligible endpoint
//!   └── subscribe() → FeedSubscription::next() on tick or registry change
//!
//! Exposition
//!   ├── render_http_sd() → JSON for /sd/targets
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod discovery;
pub mod prometheus;

pub use discovery::{DiscoveryFeed, FeedSubscription};
pub use prometheus::{StatusReport, render_http_sd, render_prometheus};
