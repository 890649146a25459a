//! Live replication of one store with one peer.
//!
//! Both sides send `Hello` and `Have`, answer the peer's `Have` with the
//! entries it lacks, then forward every newly accepted entry. Duplicates are
//! dropped by the store, so the loop never needs to agree on who sends what.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{discovery_hash, ReplicatedStore, SignedEntry, WriterId};
use crate::error::{MasqError, MasqResult};
use crate::swarm::{FrameSink, PeerConnection};

/// Upper bound on entries per `Entries` frame
const ENTRIES_PER_FRAME: usize = 256;

/// Frames exchanged by a replication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Confirms both sides hold the same store
    Hello {
        /// Discovery hash of the store
        discovery: [u8; 32],
    },
    /// Feed lengths the sender holds
    Have {
        /// `(writer, length)` pairs
        heads: Vec<(WriterId, u64)>,
    },
    /// Entries the receiver may be missing
    Entries {
        /// Entries in feed order per writer
        entries: Vec<SignedEntry>,
    },
}

type Outbox = mpsc::UnboundedSender<Bytes>;

fn send(out: &Outbox, msg: &ReplicationMessage) -> MasqResult<()> {
    let bytes = postcard::to_allocvec(msg)?;
    out.send(Bytes::from(bytes))
        .map_err(|_| MasqError::Transport("replication writer closed".to_string()))
}

fn send_entries(
    out: &Outbox,
    entries: Vec<SignedEntry>,
    peer_heads: &mut HashMap<WriterId, u64>,
) -> MasqResult<()> {
    for chunk in entries.chunks(ENTRIES_PER_FRAME) {
        for entry in chunk {
            note_head(peer_heads, entry);
        }
        send(
            out,
            &ReplicationMessage::Entries {
                entries: chunk.to_vec(),
            },
        )?;
    }
    Ok(())
}

/// Drain the outbox into the sink so reads never wait on writes.
async fn write_loop(mut sink: FrameSink, mut outbox: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Replication writer stopped");
            return;
        }
    }
    let _ = sink.close().await;
}

fn note_head(heads: &mut HashMap<WriterId, u64>, entry: &SignedEntry) {
    let len = heads.entry(entry.body.writer).or_insert(0);
    *len = (*len).max(entry.body.seq + 1);
}

impl ReplicatedStore {
    /// Replicate with one peer until either side closes or `cancel` fires.
    ///
    /// Safe to run concurrently for many peers against the same handle.
    pub async fn replicate(
        self: &Arc<Self>,
        conn: PeerConnection,
        cancel: CancellationToken,
    ) -> MasqResult<()> {
        self.ready().await?;
        let key = self.key().await?;
        let (peer, sink, mut stream) = conn.split();
        let (out, outbox) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, outbox));

        // Subscribe before reading heads so nothing accepted in between is lost
        let mut events = self.subscribe();
        let mut peer_heads: HashMap<WriterId, u64> = HashMap::new();
        let mut peer_heads_known = false;

        send(
            &out,
            &ReplicationMessage::Hello {
                discovery: discovery_hash(&key.0),
            },
        )?;
        send(
            &out,
            &ReplicationMessage::Have {
                heads: self.heads().await?,
            },
        )?;

        info!(store = %self.name(), %peer, "Replication started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                frame = stream.next() => {
                    let bytes = match frame {
                        None => break,
                        Some(Err(e)) => {
                            return Err(MasqError::Transport(format!("replication recv: {}", e)))
                        }
                        Some(Ok(bytes)) => bytes,
                    };
                    match postcard::from_bytes::<ReplicationMessage>(&bytes)? {
                        ReplicationMessage::Hello { discovery } => {
                            if discovery != discovery_hash(&key.0) {
                                return Err(MasqError::Store(format!(
                                    "{}: peer {} replicates a different store",
                                    self.name(),
                                    peer
                                )));
                            }
                        }
                        ReplicationMessage::Have { heads } => {
                            peer_heads = heads.into_iter().collect();
                            peer_heads_known = true;
                            let missing = self.missing_for(&peer_heads).await?;
                            debug!(store = %self.name(), %peer, count = missing.len(), "Sending missing entries");
                            send_entries(&out, missing, &mut peer_heads)?;
                        }
                        ReplicationMessage::Entries { entries } => {
                            for entry in &entries {
                                note_head(&mut peer_heads, entry);
                            }
                            let added = self.ingest(entries).await?;
                            if added > 0 {
                                debug!(store = %self.name(), %peer, added, "Ingested entries");
                            }
                        }
                    }
                }

                event = events.recv() => match event {
                    Ok(entry) => {
                        let known = peer_heads
                            .get(&entry.body.writer)
                            .is_some_and(|len| *len > entry.body.seq);
                        if !known {
                            send_entries(&out, vec![entry], &mut peer_heads)?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(store = %self.name(), %peer, skipped, "Replication lagged, re-diffing");
                        // Before the peer's Have arrives, answering it covers the gap
                        if peer_heads_known {
                            let missing = self.missing_for(&peer_heads).await?;
                            send_entries(&out, missing, &mut peer_heads)?;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        drop(out);
        if cancel.is_cancelled() {
            writer.abort();
        } else {
            let _ = writer.await;
        }
        info!(store = %self.name(), %peer, "Replication ended");
        Ok(())
    }
}
