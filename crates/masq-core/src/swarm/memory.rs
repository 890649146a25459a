//! In-process rendezvous over duplex pipes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PeerConnected, PeerConnection, Rendezvous, SwarmSession};
use crate::error::MasqResult;

const PIPE_CAPACITY: usize = 64 * 1024;

struct Member {
    peer_id: String,
    tx: mpsc::UnboundedSender<MasqResult<PeerConnected>>,
    cancel: CancellationToken,
}

/// Shared switchboard; every node created from one hub can reach the others.
#[derive(Clone, Default)]
pub struct MemoryHub {
    channels: Arc<Mutex<HashMap<String, Vec<Member>>>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// A node attached to this hub
    pub fn node(&self, id: impl Into<String>) -> MemoryRendezvous {
        MemoryRendezvous {
            hub: self.clone(),
            id: id.into(),
        }
    }

    /// Number of live members on a channel
    pub fn members(&self, channel: &str) -> usize {
        let channels = self.channels.lock();
        channels
            .get(channel)
            .map(|m| m.iter().filter(|m| !m.cancel.is_cancelled()).count())
            .unwrap_or(0)
    }
}

/// One node on a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryRendezvous {
    hub: MemoryHub,
    id: String,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn join(&self, channel: &str) -> MasqResult<SwarmSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut channels = self.hub.channels.lock();
        let members = channels.entry(channel.to_string()).or_default();
        members.retain(|m| !m.cancel.is_cancelled() && !m.tx.is_closed());

        for member in members.iter() {
            if member.peer_id == self.id {
                continue;
            }
            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            let _ = member.tx.send(Ok(PeerConnected {
                peer_id: self.id.clone(),
                conn: PeerConnection::new(self.id.clone(), theirs),
            }));
            let _ = tx.send(Ok(PeerConnected {
                peer_id: member.peer_id.clone(),
                conn: PeerConnection::new(member.peer_id.clone(), ours),
            }));
        }

        members.push(Member {
            peer_id: self.id.clone(),
            tx,
            cancel: cancel.clone(),
        });
        debug!(channel, node = %self.id, peers = members.len() - 1, "Joined memory channel");

        Ok(SwarmSession::new(channel, rx, cancel))
    }

    fn local_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_two_nodes_meet() {
        let hub = MemoryHub::new();
        let alice = hub.node("alice");
        let bob = hub.node("bob");

        let mut a = alice.join("room").await.unwrap();
        let mut b = bob.join("room").await.unwrap();

        let mut from_a = a.next_peer().await.unwrap().unwrap();
        let mut from_b = b.next_peer().await.unwrap().unwrap();
        assert_eq!(from_a.peer_id, "bob");
        assert_eq!(from_b.peer_id, "alice");

        from_a.conn.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&from_b.conn.recv().await.unwrap().unwrap()[..], b"hi");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = MemoryHub::new();
        let _a = hub.node("alice").join("one").await.unwrap();
        let _b = hub.node("bob").join("two").await.unwrap();
        assert_eq!(hub.members("one"), 1);
        assert_eq!(hub.members("two"), 1);
    }

    #[tokio::test]
    async fn test_closed_member_is_dropped() {
        let hub = MemoryHub::new();
        let mut a = hub.node("alice").join("room").await.unwrap();
        a.close();
        assert_eq!(hub.members("room"), 0);

        let mut b = hub.node("bob").join("room").await.unwrap();
        b.close();
        assert!(b.next_peer().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_three_peers_all_reported() {
        let hub = MemoryHub::new();
        let mut a = hub.node("a").join("room").await.unwrap();
        let _b = hub.node("b").join("room").await.unwrap();
        let _c = hub.node("c").join("room").await.unwrap();

        let first = a.next_peer().await.unwrap().unwrap();
        let second = a.next_peer().await.unwrap().unwrap();
        assert_eq!(first.peer_id, "b");
        assert_eq!(second.peer_id, "c");
    }
}
