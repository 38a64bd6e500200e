//! Control-plane node — assembles the subsystems of `scalegridd run`.
//!
//! Startup order:
//! 1. Coordination store (embedded redb, or a shared store over HTTP)
//! 2. Cluster peer, joined to the configured seeds
//! 3. Autoscale manager and the ownership resolver that drives it
//! 4. REST API
//!
//! Shutdown runs in reverse: the resolver stops its workers and releases
//! every lease, the manager drains within the grace period, then the peer
//! leaves the cluster and shuts down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use scalegrid_api::ApiState;
use scalegrid_autoscale::{
    ActionExecutor, AutoscaleManager, HttpActionExecutor, MetricSource, PrometheusSource,
};
use scalegrid_cluster::{MembershipView, Peer};
use scalegrid_coord::{CoordinationAdapter, OwnershipResolver};
use scalegrid_state::{Clock, KvStore, RemoteStore, StateStore, SystemClock, keys};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{NodeConfig, StoreTarget};
use crate::store::spawn_reaper;

/// Interval of the lease reaper when this process owns the store.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// The pluggable parts of a node.
pub struct Components {
    pub store: Arc<dyn KvStore>,
    pub metrics: Arc<dyn MetricSource>,
    pub executor: Arc<dyn ActionExecutor>,
    pub clock: Arc<dyn Clock>,
    /// Set when this process owns the store; expired leases are then
    /// reaped here.
    pub embedded: Option<StateStore>,
}

impl Components {
    /// Production wiring. Fails if the store cannot be opened or reached.
    pub async fn from_config(config: &NodeConfig) -> anyhow::Result<Self> {
        let (store, embedded): (Arc<dyn KvStore>, Option<StateStore>) = match &config.store {
            StoreTarget::Remote(url) => {
                let remote = RemoteStore::new(url).with_timeout(config.coord.call_timeout);
                remote
                    .list_prefix(keys::LOCKS)
                    .await
                    .with_context(|| format!("coordination store {url} is unreachable"))?;
                info!(%url, "connected to coordination store");
                (Arc::new(remote), None)
            }
            StoreTarget::Embedded(path) => {
                if let Some(dir) = path.parent()
                    && !dir.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(dir)?;
                }
                let store = StateStore::open(path)
                    .with_context(|| format!("opening store {}", path.display()))?;
                info!(path = ?path, "embedded coordination store opened");
                (Arc::new(store.clone()), Some(store))
            }
            StoreTarget::InMemory => {
                warn!("using a volatile in-memory store; state is lost on exit");
                let store = StateStore::open_in_memory()?;
                (Arc::new(store.clone()), Some(store))
            }
        };

        Ok(Self {
            store,
            metrics: Arc::new(PrometheusSource::new(&config.metrics_url, config.metrics_timeout)),
            executor: Arc::new(HttpActionExecutor::new(config.action_timeout)),
            clock: Arc::new(SystemClock),
            embedded,
        })
    }
}

/// A running control-plane node.
pub struct Node {
    peer: Peer,
    adapter: Arc<CoordinationAdapter>,
    manager: Arc<AutoscaleManager>,
    api: ApiState,
    shutdown_tx: watch::Sender<bool>,
    resolver: JoinHandle<()>,
    reaper: Option<JoinHandle<()>>,
    grace: Duration,
}

impl Node {
    /// Join the cluster and start evaluating policies. The peer must
    /// already be started; it is shut down again if joining fails.
    pub async fn start(config: &NodeConfig, peer: Peer, parts: Components) -> anyhow::Result<Self> {
        if !config.seeds.is_empty()
            && let Err(e) = peer.join(&config.seeds, config.replay_on_join).await
        {
            peer.shutdown().await;
            bail!("joining cluster: {e}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = parts
            .embedded
            .map(|store| spawn_reaper(store, REAP_INTERVAL, shutdown_rx.clone()));

        let adapter = Arc::new(CoordinationAdapter::new(
            parts.store.clone(),
            peer.name(),
            config.coord.clone(),
        ));
        let manager = Arc::new(AutoscaleManager::new(
            adapter.clone(),
            parts.metrics,
            parts.executor,
            parts.clock.clone(),
        ));
        let resolver = OwnershipResolver::new(
            adapter.clone(),
            manager.clone(),
            peer.subscribe(),
            config.resync_interval,
        );
        let resolver = tokio::spawn(resolver.run(shutdown_rx));

        let api = ApiState {
            store: parts.store,
            clock: parts.clock,
            membership: peer.subscribe(),
        };
        info!(node = %peer.name(), addr = %peer.local_addr(), "node started");

        Ok(Self {
            peer,
            adapter,
            manager,
            api,
            shutdown_tx,
            resolver,
            reaper,
            grace: config.shutdown_grace,
        })
    }

    pub fn name(&self) -> &str {
        self.peer.name()
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn members(&self) -> MembershipView {
        self.peer.members()
    }

    pub fn manager(&self) -> &Arc<AutoscaleManager> {
        &self.manager
    }

    /// Policies whose lease this node holds.
    pub fn owned(&self) -> Vec<String> {
        self.adapter.held_policies()
    }

    pub fn api_state(&self) -> ApiState {
        self.api.clone()
    }

    /// Graceful stop: release leases, drain workers, leave, shut down.
    pub async fn shutdown(self) {
        info!(node = %self.peer.name(), "node shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.resolver.await {
            error!(error = %e, "resolver task failed");
        }
        self.manager.stop_all(self.grace).await;
        if let Some(reaper) = self.reaper {
            let _ = reaper.await;
        }

        if let Err(e) = self.peer.leave().await {
            warn!(error = %e, "leave failed");
        }
        self.peer.shutdown().await;
        info!("node stopped");
    }

    /// Stop at once without releasing leases or leaving the cluster, as a
    /// crashed process would. Other nodes take over once the leases expire
    /// and the failure detector notices.
    pub async fn abort(self) {
        warn!(node = %self.peer.name(), "node aborting");
        self.resolver.abort();
        let _ = self.resolver.await;
        self.manager.stop_all(Duration::ZERO).await;
        if let Some(reaper) = self.reaper {
            reaper.abort();
        }
        self.peer.shutdown().await;
    }
}

/// `scalegridd run`: start a node, serve the API, stop on SIGINT/SIGTERM.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(node = %config.name, "scalegrid node starting");

    let parts = Components::from_config(&config).await?;
    let peer = Peer::start(config.peer.clone())
        .await
        .context("starting cluster peer")?;
    let node = Node::start(&config, peer, parts).await?;

    let listener = match tokio::net::TcpListener::bind(config.api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            node.shutdown().await;
            return Err(e).with_context(|| format!("binding API address {}", config.api_addr));
        }
    };
    info!(addr = %config.api_addr, "API server starting");

    let router = scalegrid_api::build_router(node.api_state());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    node.shutdown().await;
    served.context("API server failed")?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
