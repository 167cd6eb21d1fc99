//! Standalone mode — every subsystem in one process.
//!
//! In this mode, the daemon:
//! 1. Opens the resource store under the data directory
//! 2. Applies startup manifests, if any
//! 3. Starts the reconciler (per-workload workers + liveness monitor)
//! 4. Starts the discovery watcher
//! 5. Serves the REST API until Ctrl-C

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use topo_api::{ApiState, build_router};
use topo_core::config::SubstrateKind;
use topo_core::TopoConfig;
use topo_metrics::DiscoveryFeed;
use topo_proxy::{IngressRouter, ProxySync, ServiceRegistry};
use topo_runtime::{
    FileSecretStore, ProcessSubstrate, SecretStore, SimSubstrate, StaticSecretStore, Substrate,
};
use topo_scheduler::Reconciler;
use topo_state::{ApplyOutcome, StateStore, manifest};

/// Every long-lived subsystem, wired together.
pub struct Stack {
    pub config: TopoConfig,
    pub store: StateStore,
    pub proxy: ProxySync,
    pub reconciler: Reconciler,
    pub feed: DiscoveryFeed,
}

impl Stack {
    /// Open the store under `daemon.data_dir` and wire every subsystem.
    pub fn open(config: TopoConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir)?;
        let db_path = config.daemon.data_dir.join("topo.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Ok(Self::assemble(config, store))
    }

    pub fn assemble(config: TopoConfig, store: StateStore) -> Self {
        let substrate: Arc<dyn Substrate> = match config.daemon.substrate {
            SubstrateKind::Sim => Arc::new(SimSubstrate::new()),
            SubstrateKind::Process => {
                Arc::new(ProcessSubstrate::new(config.daemon.data_dir.join("members")))
            }
        };
        info!(substrate = ?config.daemon.substrate, "compute substrate initialized");

        let secrets: Arc<dyn SecretStore> = match &config.daemon.secrets_dir {
            Some(dir) => {
                info!(path = ?dir, "file secret store initialized");
                Arc::new(FileSecretStore::new(dir.clone()))
            }
            None => Arc::new(StaticSecretStore::new()),
        };

        let registry = Arc::new(ServiceRegistry::new(&config.registry));
        let proxy = ProxySync::new(registry.clone(), Arc::new(IngressRouter::new()));
        info!(domain = %registry.domain(), "service registry initialized");

        let reconciler = Reconciler::new(store.clone(), substrate, secrets, proxy.clone(), &config);
        let feed = DiscoveryFeed::new(store.clone(), registry, &config.discovery);

        Self {
            config,
            store,
            proxy,
            reconciler,
            feed,
        }
    }

    /// Apply a manifest file or directory. Returns the number of documents.
    pub fn apply_manifests(&self, path: &Path) -> anyhow::Result<usize> {
        let docs = manifest::load_path(path)?;
        let results = self.store.apply_all(&docs)?;
        let changed = results
            .iter()
            .filter(|(_, outcome)| *outcome != ApplyOutcome::Unchanged)
            .count();
        info!(path = ?path, documents = results.len(), changed, "manifests applied");
        Ok(results.len())
    }

    pub fn router(&self) -> Router {
        build_router(ApiState {
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            proxy: self.proxy.clone(),
            feed: self.feed.clone(),
        })
    }

    /// Start the background tasks. They stop when `shutdown` flips.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.reconciler.start(shutdown.clone()),
            spawn_discovery_watch(self.feed.clone(), shutdown),
        ]
    }
}

/// Log scrape target changes as the feed sees them.
fn spawn_discovery_watch(feed: DiscoveryFeed, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = feed.subscribe();
        let mut last = Vec::new();
        loop {
            tokio::select! {
                targets = subscription.next() => {
                    if targets != last {
                        info!(targets = targets.len(), "scrape targets changed");
                        last = targets;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Run the daemon until Ctrl-C.
pub async fn run_standalone(config: TopoConfig) -> anyhow::Result<()> {
    info!("topo daemon starting in standalone mode");

    let port = config.api.port;
    let manifests = config.daemon.manifests.clone();
    let stack = Stack::open(config)?;
    if let Some(path) = manifests {
        stack.apply_manifests(&path)?;
    }

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = stack.start(shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, stack.router())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("topo daemon stopped");
    Ok(())
}
