//! Target discovery — scrape targets derived from the service registry.
//!
//! Every read works on a registry snapshot, so the feed never takes a
//! registry lock held by the reconciler and never writes anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use topo_core::config::DiscoveryConfig;
use topo_proxy::{RegistrySnapshot, ServiceRegistry};
use topo_state::{MetricsConfig, ScrapeTarget, StateStore};

/// Pull interface over the current scrape targets.
#[derive(Clone)]
pub struct DiscoveryFeed {
    state: StateStore,
    registry: Arc<ServiceRegistry>,
    interval: Duration,
    metrics_path: String,
}

impl DiscoveryFeed {
    pub fn new(state: StateStore, registry: Arc<ServiceRegistry>, config: &DiscoveryConfig) -> Self {
        Self {
            state,
            registry,
            interval: config.interval.max(Duration::from_secs(1)),
            metrics_path: config.metrics_path.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One target per eligible endpoint of every service, in service
    /// name order and member order within a service.
    pub fn current(&self) -> Vec<ScrapeTarget> {
        self.derive(&self.registry.snapshot())
    }

    fn derive(&self, snapshot: &RegistrySnapshot) -> Vec<ScrapeTarget> {
        let mut overrides: HashMap<&str, MetricsConfig> = HashMap::new();
        let mut targets = Vec::new();

        for view in &snapshot.services {
            let metrics = overrides
                .entry(view.workload.as_str())
                .or_insert_with(|| self.workload_metrics(&view.workload));

            let interval_secs = metrics
                .interval_secs
                .unwrap_or_else(|| self.interval.as_secs());
            let metrics_path = metrics
                .path
                .clone()
                .unwrap_or_else(|| self.metrics_path.clone());

            targets.extend(view.endpoints.iter().map(|ep| ScrapeTarget {
                job_name: view.name.clone(),
                address: ep.address.clone(),
                port: metrics.port.unwrap_or(ep.port),
                interval_secs,
                metrics_path: metrics_path.clone(),
            }));
        }
        targets
    }

    fn workload_metrics(&self, workload: &str) -> MetricsConfig {
        match self.state.get_workload(workload) {
            Ok(spec) => spec.and_then(|s| s.metrics).unwrap_or_default(),
            Err(e) => {
                warn!(%workload, error = %e, "reading workload for scrape targets, using defaults");
                MetricsConfig::default()
            }
        }
    }

    /// Start a subscription. The first `next()` returns immediately;
    /// later ones wait for the interval or a registry change. Dropping
    /// the subscription and subscribing again restarts the sequence.
    pub fn subscribe(&self) -> FeedSubscription {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        FeedSubscription {
            feed: self.clone(),
            changes: self.registry.subscribe(),
            ticker,
        }
    }
}

/// Lazy sequence of scrape target snapshots.
pub struct FeedSubscription {
    feed: DiscoveryFeed,
    changes: watch::Receiver<Arc<RegistrySnapshot>>,
    ticker: Interval,
}

impl FeedSubscription {
    pub async fn next(&mut self) -> Vec<ScrapeTarget> {
        tokio::select! {
            _ = self.ticker.tick() => {}
            Ok(()) = self.changes.changed() => {
                self.ticker.reset();
            }
        }
        let snapshot = self.changes.borrow_and_update().clone();
        let targets = self.feed.derive(&snapshot);
        debug!(version = snapshot.version, targets = targets.len(), "scrape targets refreshed");
        targets
    }
}
