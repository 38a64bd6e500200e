//! Peer lifecycle — this node's entry and exit point for the cluster.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::detector::Detector;
use crate::error::{ClusterError, ClusterResult};
use crate::member::MembershipView;
use crate::net::NetTransport;
use crate::transport::{Inbound, Transport};

/// A running cluster member.
///
/// `start` binds the listeners and starts the failure detector; the peer
/// then participates until `shutdown`. The membership view is exposed only
/// as snapshots.
pub struct Peer {
    name: String,
    detector: Arc<Detector>,
    transport: Arc<dyn Transport>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Peer {
    /// Bind the UDP and TCP listeners on `config.bind_addr` and start the
    /// detector. Fails if the configuration is invalid or the address is
    /// unavailable.
    pub async fn start(config: PeerConfig) -> ClusterResult<Self> {
        config.validate()?;
        let (transport, inbound) =
            NetTransport::bind(config.bind_addr, config.advertise_addr, config.tcp_timeout)
                .await?;
        Ok(Self::with_transport(config, transport, inbound))
    }

    /// Start a peer over an already bound transport.
    pub fn with_transport(
        config: PeerConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        let name = config.name.clone();
        let detector = Detector::new(config, transport.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = detector.spawn(inbound, shutdown_rx);
        info!(node = %name, addr = %transport.local_addr(), "peer started");
        Self {
            name,
            detector,
            transport,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.detector.local_addr()
    }

    /// Contact each seed in order with a push-pull exchange. Returns the
    /// number of seeds that answered; fails if seeds were given and none
    /// responded. Seeds equal to this node's own address are skipped.
    pub async fn join(&self, seeds: &[SocketAddr], replay: bool) -> ClusterResult<usize> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::NotRunning);
        }
        let own = self.local_addr();
        let seeds: Vec<SocketAddr> = seeds.iter().copied().filter(|s| *s != own).collect();
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut contacted = 0;
        for seed in &seeds {
            match self.detector.exchange(*seed, replay).await {
                Ok(members) => {
                    contacted += 1;
                    debug!(%seed, members, "seed contacted");
                }
                Err(e) => warn!(%seed, error = %e, "seed unreachable"),
            }
        }

        if contacted == 0 {
            return Err(ClusterError::NoSeedsReachable {
                attempted: seeds.len(),
            });
        }
        info!(contacted, members = self.members().len(), "joined cluster");
        Ok(contacted)
    }

    /// Broadcast Left and wait, up to the leave timeout, for a live peer to
    /// acknowledge it. An unacknowledged leave is logged, not an error.
    pub async fn leave(&self) -> ClusterResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::NotRunning);
        }
        if !self.detector.leave().await {
            warn!("leave was not acknowledged before the timeout");
        }
        Ok(())
    }

    /// Stop all protocol loops and close the listeners. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        self.transport.close().await;
        info!(node = %self.name, "peer stopped");
    }

    /// Snapshot of the current membership view.
    pub fn members(&self) -> MembershipView {
        self.detector.view()
    }

    /// Watch membership changes.
    pub fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.detector.subscribe()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
