//! Wire messages of the membership protocol.
//!
//! Packets (probe, ack, gossip) are single JSON datagrams. Push-pull runs
//! over a stream where each message is a JSON document preceded by its
//! length as a 4-byte big-endian integer.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClusterError, ClusterResult};
use crate::member::PeerUpdate;

/// Largest frame accepted on a push-pull stream.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A datagram: who sent it, what it asks for, and piggybacked events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerUpdate,
    pub body: Body,
    #[serde(default)]
    pub events: Vec<PeerUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Direct probe; answered with an `Ack` carrying the same sequence number.
    Ping { seq: u64 },
    /// Ask the receiver to probe `target` on the sender's behalf and relay
    /// the ack back under `seq`.
    IndirectPing {
        seq: u64,
        target: String,
        target_addr: SocketAddr,
    },
    Ack { seq: u64 },
    /// Carries only piggybacked events.
    Gossip,
}

/// Full-state exchange, sent as request and answered in kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPull {
    pub sender: PeerUpdate,
    pub members: Vec<PeerUpdate>,
    /// Set on a join that wants recent history replayed.
    #[serde(default)]
    pub replay: bool,
    /// Recent events, present in a response to a replaying join.
    #[serde(default)]
    pub history: Vec<PeerUpdate>,
}

pub fn encode<T: Serialize>(msg: &T) -> ClusterResult<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| ClusterError::Encode(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> ClusterResult<T> {
    serde_json::from_slice(buf).map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg).map_err(std::io::Error::other)?;
    let len = u32::try_from(body.len()).map_err(std::io::Error::other)?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
