//! UDP + TCP transport.
//!
//! Packets travel as UDP datagrams; push-pull uses a short-lived TCP
//! connection per exchange. Both listeners share one port.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::message::{self, Envelope, PushPull};
use crate::transport::{INBOUND_BUFFER, Inbound, Transport};

/// Largest UDP payload.
const MAX_PACKET: usize = 65_507;

pub struct NetTransport {
    socket: Arc<UdpSocket>,
    advertise: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetTransport {
    /// Bind the packet and stream listeners. A port of 0 picks a free port
    /// shared by both.
    pub async fn bind(
        addr: SocketAddr,
        advertise: Option<SocketAddr>,
        tcp_timeout: Duration,
    ) -> ClusterResult<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClusterError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ClusterError::Bind { addr, source })?;
        let socket = UdpSocket::bind(bound)
            .await
            .map_err(|source| ClusterError::Bind {
                addr: bound,
                source,
            })?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        let packets = tokio::spawn(recv_packets(socket.clone(), tx.clone()));
        let streams = tokio::spawn(accept_streams(listener, tx, tcp_timeout));

        debug!(%bound, "cluster transport listening");
        let transport = Arc::new(Self {
            socket,
            advertise: advertise.unwrap_or(bound),
            tasks: Mutex::new(vec![packets, streams]),
        });
        Ok((transport, rx))
    }
}

async fn recv_packets(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "packet receive failed");
                continue;
            }
        };
        let envelope: Envelope = match message::decode(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed packet");
                continue;
            }
        };
        if tx.send(Inbound::Packet { from, envelope }).await.is_err() {
            break;
        }
    }
}

async fn accept_streams(listener: TcpListener, tx: mpsc::Sender<Inbound>, timeout: Duration) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "stream accept failed");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, serve_push_pull(stream, tx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%from, error = %e, "push-pull exchange failed"),
                Err(_) => debug!(%from, ?timeout, "push-pull exchange timed out"),
            }
        });
    }
}

async fn serve_push_pull(mut stream: TcpStream, tx: mpsc::Sender<Inbound>) -> std::io::Result<()> {
    let request: PushPull = message::read_frame(&mut stream).await?;
    let (reply, response) = oneshot::channel();
    tx.send(Inbound::PushPull { request, reply })
        .await
        .map_err(std::io::Error::other)?;
    let response = response.await.map_err(std::io::Error::other)?;
    message::write_frame(&mut stream, &response).await
}

#[async_trait]
impl Transport for NetTransport {
    fn local_addr(&self) -> SocketAddr {
        self.advertise
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> ClusterResult<()> {
        let buf = message::encode(envelope)?;
        if buf.len() > MAX_PACKET {
            return Err(ClusterError::Encode(format!(
                "packet of {} bytes exceeds limit",
                buf.len()
            )));
        }
        self.socket
            .send_to(&buf, to)
            .await
            .map_err(|e| ClusterError::Network {
                addr: to,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn push_pull(
        &self,
        to: SocketAddr,
        request: &PushPull,
        timeout: Duration,
    ) -> ClusterResult<PushPull> {
        let exchange = async {
            let mut stream = TcpStream::connect(to).await?;
            message::write_frame(&mut stream, request).await?;
            message::read_frame::<_, PushPull>(&mut stream).await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ClusterError::Network {
                addr: to,
                reason: e.to_string(),
            }),
            Err(_) => Err(ClusterError::Timeout(timeout)),
        }
    }

    async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}
