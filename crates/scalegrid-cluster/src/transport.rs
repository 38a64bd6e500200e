//! Transport seam between the failure detector and the network.
//!
//! A transport delivers packets unreliably and push-pull exchanges over a
//! reliable stream. Inbound traffic is handed to the detector through an
//! mpsc channel created when the transport is bound.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::ClusterResult;
use crate::message::{Envelope, PushPull};

/// Depth of the inbound channel.
pub const INBOUND_BUFFER: usize = 1024;

/// Traffic arriving at a transport.
#[derive(Debug)]
pub enum Inbound {
    Packet {
        from: SocketAddr,
        envelope: Envelope,
    },
    /// A push-pull request; the detector answers through `reply`.
    PushPull {
        request: PushPull,
        reply: oneshot::Sender<PushPull>,
    },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address other peers reach this node at.
    fn local_addr(&self) -> SocketAddr;

    /// Best-effort datagram send.
    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> ClusterResult<()>;

    /// Exchange full state with `to`, bounded by `timeout`.
    async fn push_pull(
        &self,
        to: SocketAddr,
        request: &PushPull,
        timeout: Duration,
    ) -> ClusterResult<PushPull>;

    /// Stop listening. Idempotent.
    async fn close(&self);
}
