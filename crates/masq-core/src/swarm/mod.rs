//! Channel-scoped peer discovery and framed duplex connections.
//!
//! A [`Rendezvous`] joins a channel and reports every peer that joins the
//! same channel as a [`PeerConnected`] event carrying a [`PeerConnection`].
//! Joining transmits no payload by itself; all data flows through the
//! per-peer connection.

mod addr;
mod gossip;
mod memory;

pub use addr::NodeAddrBytes;
pub use gossip::{IrohRendezvous, PAIRING_ALPN};
pub use memory::{MemoryHub, MemoryRendezvous};

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MasqError, MasqResult};

/// Largest frame accepted on a peer connection
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Byte stream usable as a peer transport
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

type Transport = Framed<Box<dyn DuplexStream>, LengthDelimitedCodec>;

/// Sending half of a split connection
pub type FrameSink = SplitSink<Transport, Bytes>;

/// Receiving half of a split connection
pub type FrameStream = SplitStream<Transport>;

/// Derive the 32-byte topic for a rendezvous channel.
pub fn channel_topic(channel: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"masq-swarm-channel-v1");
    hasher.update(channel.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Length-delimited message connection to one peer.
pub struct PeerConnection {
    peer_id: String,
    framed: Transport,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a byte stream to `peer_id`.
    pub fn new(peer_id: impl Into<String>, stream: impl DuplexStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let boxed: Box<dyn DuplexStream> = Box::new(stream);
        Self {
            peer_id: peer_id.into(),
            framed: Framed::new(boxed, codec),
        }
    }

    /// Remote peer identifier
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: impl Into<Bytes>) -> MasqResult<()> {
        self.framed
            .send(frame.into())
            .await
            .map_err(|e| MasqError::Transport(format!("send to {}: {}", self.peer_id, e)))
    }

    /// Receive one frame; `None` once the peer has closed.
    pub async fn recv(&mut self) -> MasqResult<Option<BytesMut>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(MasqError::Transport(format!(
                "recv from {}: {}",
                self.peer_id, e
            ))),
            None => Ok(None),
        }
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> MasqResult<()> {
        SinkExt::<Bytes>::close(&mut self.framed)
            .await
            .map_err(|e| MasqError::Transport(format!("close {}: {}", self.peer_id, e)))
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (String, FrameSink, FrameStream) {
        let (sink, stream) = self.framed.split();
        (self.peer_id, sink, stream)
    }
}

/// A peer reached on a joined channel
#[derive(Debug)]
pub struct PeerConnected {
    /// Remote peer identifier
    pub peer_id: String,
    /// Connection to that peer
    pub conn: PeerConnection,
}

/// Membership of one rendezvous channel.
///
/// Dropping the session closes it.
pub struct SwarmSession {
    channel: String,
    peers: mpsc::UnboundedReceiver<MasqResult<PeerConnected>>,
    cancel: CancellationToken,
    closed: bool,
}

impl fmt::Debug for SwarmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmSession")
            .field("channel", &self.channel)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SwarmSession {
    /// Build a session fed by a rendezvous implementation.
    ///
    /// `cancel` is cancelled on close so the implementation can release the
    /// channel.
    pub fn new(
        channel: impl Into<String>,
        peers: mpsc::UnboundedReceiver<MasqResult<PeerConnected>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel: channel.into(),
            peers,
            cancel,
            closed: false,
        }
    }

    /// Channel this session joined
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next peer; `None` once the session is closed.
    pub async fn next_peer(&mut self) -> MasqResult<Option<PeerConnected>> {
        if self.closed {
            return Ok(None);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            event = self.peers.recv() => event.transpose(),
        }
    }

    /// Leave the channel. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        self.peers.close();
        debug!(channel = %self.channel, "Swarm session closed");
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Token cancelled when the session closes
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SwarmSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channel-based peer discovery.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Join `channel` and start reporting peers.
    async fn join(&self, channel: &str) -> MasqResult<SwarmSession>;

    /// This node's identifier as seen by peers
    fn local_id(&self) -> String;

    /// Address other nodes can bootstrap through, if the transport has one
    fn local_addr(&self) -> Option<NodeAddrBytes> {
        None
    }

    /// Learn peers to bootstrap later joins through.
    fn add_peers(&self, _peers: &[NodeAddrBytes]) -> MasqResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = PeerConnection::new("b", a);
        let mut right = PeerConnection::new("a", b);

        left.send(Bytes::from_static(b"hello")).await.unwrap();
        left.send(Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(&right.recv().await.unwrap().unwrap()[..], b"hello");
        assert_eq!(&right.recv().await.unwrap().unwrap()[..], b"world");

        left.close().await.unwrap();
        drop(left);
        assert!(right.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_close_is_idempotent() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut session = SwarmSession::new("c", rx, CancellationToken::new());
        let token = session.cancel_token();

        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(token.is_cancelled());
        assert!(session.next_peer().await.unwrap().is_none());
    }

    #[test]
    fn test_channel_topic_distinct() {
        assert_eq!(channel_topic("a"), channel_topic("a"));
        assert_ne!(channel_topic("a"), channel_topic("b"));
    }
}
