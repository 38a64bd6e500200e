//! In-process transport for simulations and tests.
//!
//! A [`MemoryNetwork`] routes packets between transports bound to it.
//! Packets can be dropped at a configurable rate and individual addresses
//! can be cut off to simulate partitions or crashes; push-pull streams are
//! reliable unless an endpoint is cut off.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClusterError, ClusterResult};
use crate::message::{Envelope, PushPull};
use crate::transport::{INBOUND_BUFFER, Inbound, Transport};

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<SocketAddr, mpsc::Sender<Inbound>>,
    isolated: HashSet<SocketAddr>,
    drop_rate: f64,
}

/// A simulated network shared by any number of [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a transport at `addr`, replacing any previous one.
    pub fn bind(&self, addr: SocketAddr) -> (Arc<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        self.lock().nodes.insert(addr, tx);
        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            addr,
        });
        (transport, rx)
    }

    /// Probability in `[0, 1]` that any packet is lost.
    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Cut `addr` off: nothing it sends or is sent arrives.
    pub fn isolate(&self, addr: SocketAddr) {
        self.lock().isolated.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.lock().isolated.remove(&addr);
    }

    /// Route lookup; `None` when either end is cut off or unbound.
    fn route(&self, from: SocketAddr, to: SocketAddr) -> Option<(mpsc::Sender<Inbound>, f64)> {
        let state = self.lock();
        if state.isolated.contains(&from) || state.isolated.contains(&to) {
            return None;
        }
        state.nodes.get(&to).map(|tx| (tx.clone(), state.drop_rate))
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> ClusterResult<()> {
        let Some((tx, drop_rate)) = self.network.route(self.addr, to) else {
            // Silently lost, like a datagram to a dead host.
            return Ok(());
        };
        if drop_rate > 0.0 && rand::rng().random_bool(drop_rate) {
            return Ok(());
        }
        let packet = Inbound::Packet {
            from: self.addr,
            envelope: envelope.clone(),
        };
        // A full inbound queue loses the packet.
        let _ = tx.try_send(packet);
        Ok(())
    }

    async fn push_pull(
        &self,
        to: SocketAddr,
        request: &PushPull,
        timeout: Duration,
    ) -> ClusterResult<PushPull> {
        let (tx, _) = self
            .network
            .route(self.addr, to)
            .ok_or(ClusterError::Unreachable(to))?;
        let (reply, response) = oneshot::channel();
        tx.send(Inbound::PushPull {
            request: request.clone(),
            reply,
        })
        .await
        .map_err(|_| ClusterError::Unreachable(to))?;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClusterError::Unreachable(to)),
            Err(_) => Err(ClusterError::Timeout(timeout)),
        }
    }

    async fn close(&self) {
        let mut state = self.network.lock();
        state.nodes.remove(&self.addr);
    }
}
