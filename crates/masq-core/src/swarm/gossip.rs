//! Rendezvous over iroh-gossip with direct QUIC streams per peer.
//!
//! Each channel maps to a gossip topic. Members announce their address on
//! the topic; for every pair, the member with the lower endpoint id dials the
//! other on [`PAIRING_ALPN`] and writes the 32-byte channel topic as a
//! header, which the acceptor uses to route the stream to its session.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::Event;
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{channel_topic, NodeAddrBytes, PeerConnected, PeerConnection, Rendezvous, SwarmSession};
use crate::error::{MasqError, MasqResult};

/// ALPN for channel-routed peer streams
pub const PAIRING_ALPN: &[u8] = b"masq/swarm/1";

/// Announcements are tiny; keep gossip frames small
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

type PeerSender = mpsc::UnboundedSender<MasqResult<PeerConnected>>;
type Routes = Arc<Mutex<HashMap<[u8; 32], PeerSender>>>;

/// Drop the route for `topic` if it still belongs to `tx`; a newer session
/// on the same channel keeps its own.
fn release_route(routes: &Routes, topic: &[u8; 32], tx: &PeerSender) {
    let mut routes = routes.lock();
    if routes.get(topic).is_some_and(|current| current.same_channel(tx)) {
        routes.remove(topic);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Announce {
    addr: NodeAddrBytes,
}

/// A bidirectional QUIC stream that keeps its connection alive.
struct IrohStream {
    send: SendStream,
    recv: RecvStream,
    _conn: Connection,
}

impl AsyncRead for IrohStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// Accepts [`PAIRING_ALPN`] streams and hands them to the joined session.
#[derive(Debug, Clone)]
struct SwarmProtocolHandler {
    routes: Routes,
}

impl ProtocolHandler for SwarmProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let routes = self.routes.clone();

        async move {
            let peer = conn.remote_id();
            let (send, mut recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;

            let mut topic = [0u8; 32];
            recv.read_exact(&mut topic)
                .await
                .map_err(AcceptError::from_err)?;

            let route = routes.lock().get(&topic).cloned();
            let Some(tx) = route else {
                debug!(%peer, "Stream for a channel we have not joined");
                conn.close(0u32.into(), b"unknown channel");
                return Ok(());
            };

            debug!(%peer, "Accepted swarm stream");
            let stream = IrohStream {
                send,
                recv,
                _conn: conn.clone(),
            };
            let event = PeerConnected {
                peer_id: peer.to_string(),
                conn: PeerConnection::new(peer.to_string(), stream),
            };
            if tx.send(Ok(event)).is_err() {
                return Ok(());
            }

            // Hold the connection until the peer is done with it
            let _ = conn.closed().await;
            Ok(())
        }
    }
}

/// Rendezvous over the public iroh network.
#[derive(Debug)]
pub struct IrohRendezvous {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    routes: Routes,
    bootstrap: Mutex<Vec<EndpointId>>,
}

impl IrohRendezvous {
    /// Bind an endpoint and start accepting gossip and swarm streams.
    ///
    /// `secret` fixes the endpoint identity across restarts.
    pub async fn bind(secret: Option<[u8; 32]>, bootstrap: &[NodeAddrBytes]) -> MasqResult<Self> {
        let secret_key = match secret {
            Some(bytes) => SecretKey::from_bytes(&bytes),
            None => SecretKey::generate(&mut rand::rng()),
        };

        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), PAIRING_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| MasqError::Transport(format!("Failed to bind endpoint: {}", e)))?;

        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(
                PAIRING_ALPN,
                SwarmProtocolHandler {
                    routes: routes.clone(),
                },
            )
            .spawn();

        let rendezvous = Self {
            endpoint,
            gossip,
            router,
            static_provider,
            routes,
            bootstrap: Mutex::new(Vec::new()),
        };
        for addr in bootstrap {
            rendezvous.add_peer(addr)?;
        }
        Ok(rendezvous)
    }

    /// Remember a peer so future joins can bootstrap through it.
    pub fn add_peer(&self, addr: &NodeAddrBytes) -> MasqResult<()> {
        let endpoint_addr = addr.to_endpoint_addr()?;
        if endpoint_addr.id == self.endpoint.id() {
            return Ok(());
        }
        debug!(
            peer = %endpoint_addr.id,
            relay = ?addr.relay_url,
            addrs = addr.direct_addresses.len(),
            "Adding bootstrap peer"
        );
        let id = endpoint_addr.id;
        self.static_provider.add_endpoint_info(endpoint_addr);
        let mut bootstrap = self.bootstrap.lock();
        if !bootstrap.contains(&id) {
            bootstrap.push(id);
        }
        Ok(())
    }

    /// This node's current address
    pub fn node_addr(&self) -> NodeAddrBytes {
        NodeAddrBytes::from_endpoint_addr(&self.endpoint.addr())
    }

    /// Stop accepting and close the endpoint.
    pub async fn shutdown(&self) {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        info!("Rendezvous shutdown complete");
    }
}

#[async_trait]
impl Rendezvous for IrohRendezvous {
    async fn join(&self, channel: &str) -> MasqResult<SwarmSession> {
        let topic = channel_topic(channel);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.routes.lock().insert(topic, tx.clone());

        let bootstrap = self.bootstrap.lock().clone();
        info!(channel, peers = bootstrap.len(), "Joining swarm channel");

        let gossip_topic = match self
            .gossip
            .subscribe(TopicId::from_bytes(topic), bootstrap)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                release_route(&self.routes, &topic, &tx);
                return Err(MasqError::Transport(format!("Failed to subscribe: {}", e)));
            }
        };

        let task = ChannelTask {
            endpoint: self.endpoint.clone(),
            static_provider: self.static_provider.clone(),
            routes: self.routes.clone(),
            topic,
            tx,
            cancel: cancel.clone(),
        };
        let (sender, receiver) = gossip_topic.split();
        tokio::spawn(task.run(sender, receiver));

        Ok(SwarmSession::new(channel, rx, cancel))
    }

    fn local_id(&self) -> String {
        self.endpoint.id().to_string()
    }

    fn local_addr(&self) -> Option<NodeAddrBytes> {
        Some(self.node_addr())
    }

    fn add_peers(&self, peers: &[NodeAddrBytes]) -> MasqResult<()> {
        for addr in peers {
            self.add_peer(addr)?;
        }
        Ok(())
    }
}

struct ChannelTask {
    endpoint: Endpoint,
    static_provider: StaticProvider,
    routes: Routes,
    topic: [u8; 32],
    tx: PeerSender,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(
        self,
        sender: iroh_gossip::api::GossipSender,
        mut receiver: iroh_gossip::api::GossipReceiver,
    ) {
        use n0_future::StreamExt;

        let local = self.endpoint.id();
        let announce = match postcard::to_allocvec(&Announce {
            addr: NodeAddrBytes::from_endpoint_addr(&self.endpoint.addr()),
        }) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                let _ = self.tx.send(Err(e.into()));
                return;
            }
        };
        let mut dialed: HashSet<EndpointId> = HashSet::new();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = receiver.try_next() => event,
            };

            match event {
                Ok(Some(Event::NeighborUp(peer))) => {
                    debug!(%peer, "Neighbor joined channel");
                    if let Err(e) = sender.broadcast(announce.clone()).await {
                        warn!(error = %e, "Failed to announce");
                    }
                    self.maybe_dial(local, EndpointAddr::new(peer), &mut dialed);
                }
                Ok(Some(Event::Received(msg))) => {
                    let Ok(announce) = postcard::from_bytes::<Announce>(&msg.content) else {
                        debug!(from = %msg.delivered_from, "Ignoring unknown gossip payload");
                        continue;
                    };
                    match announce.addr.to_endpoint_addr() {
                        Ok(addr) => {
                            self.static_provider.add_endpoint_info(addr.clone());
                            self.maybe_dial(local, addr, &mut dialed);
                        }
                        Err(e) => debug!(error = %e, "Ignoring bad announce"),
                    }
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    debug!(%peer, "Neighbor left channel");
                    dialed.remove(&peer);
                }
                Ok(Some(Event::Lagged)) => {
                    warn!("Lagged behind on channel topic");
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = self
                        .tx
                        .send(Err(MasqError::Transport(format!("gossip: {}", e))));
                    break;
                }
            }
        }

        release_route(&self.routes, &self.topic, &self.tx);
        debug!("Channel task finished");
    }

    fn maybe_dial(&self, local: EndpointId, addr: EndpointAddr, dialed: &mut HashSet<EndpointId>) {
        let peer = addr.id;
        if peer == local || local.as_bytes() > peer.as_bytes() || !dialed.insert(peer) {
            return;
        }

        let endpoint = self.endpoint.clone();
        let topic = self.topic;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let dial = dial(&endpoint, addr, topic);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = dial => result,
            };
            match result {
                Ok(conn) => {
                    let _ = tx.send(Ok(PeerConnected {
                        peer_id: peer.to_string(),
                        conn,
                    }));
                }
                Err(e) => warn!(%peer, error = %e, "Failed to dial peer"),
            }
        });
    }
}

async fn dial(endpoint: &Endpoint, addr: EndpointAddr, topic: [u8; 32]) -> MasqResult<PeerConnection> {
    let peer = addr.id;
    let conn = endpoint
        .connect(addr, PAIRING_ALPN)
        .await
        .map_err(|e| MasqError::Transport(format!("Failed to connect: {}", e)))?;
    let (mut send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| MasqError::Transport(format!("Failed to open stream: {}", e)))?;
    send.write_all(&topic)
        .await
        .map_err(|e| MasqError::Transport(format!("Failed to write header: {}", e)))?;

    Ok(PeerConnection::new(
        peer.to_string(),
        IrohStream {
            send,
            recv,
            _conn: conn,
        },
    ))
}
