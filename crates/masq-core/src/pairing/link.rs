//! Pairing links: `masq-pair:<base58(postcard)>`.
//!
//! A link carries everything the other side needs to join a pairing
//! session: the rendezvous channel, the pre-shared key, and optionally
//! addresses of nodes to bootstrap through.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoProvider, SharedKey, KEY_SIZE};
use crate::error::{MasqError, MasqResult};
use crate::swarm::NodeAddrBytes;

/// URI scheme prefix
pub const LINK_PREFIX: &str = "masq-pair:";

/// Current link format version
pub const LINK_VERSION: u8 = 1;

/// Decoded pairing link
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingLink {
    /// Format version
    pub version: u8,
    /// Rendezvous channel identifier
    pub channel: String,
    /// Pre-shared key for the session
    pub key: [u8; KEY_SIZE],
    /// Nodes to bootstrap discovery through
    pub bootstrap: Vec<NodeAddrBytes>,
}

impl fmt::Debug for PairingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingLink")
            .field("version", &self.version)
            .field("channel", &self.channel)
            .field("bootstrap", &self.bootstrap.len())
            .finish_non_exhaustive()
    }
}

impl PairingLink {
    /// Link for a caller-chosen channel
    pub fn new(channel: impl Into<String>, key: &SharedKey, bootstrap: Vec<NodeAddrBytes>) -> Self {
        Self {
            version: LINK_VERSION,
            channel: channel.into(),
            key: *key.as_bytes(),
            bootstrap,
        }
    }

    /// Fresh link with a random channel and key.
    pub fn generate(crypto: &dyn CryptoProvider, bootstrap: Vec<NodeAddrBytes>) -> Self {
        let mut channel = [0u8; 16];
        crypto.fill_bytes(&mut channel);
        let key = SharedKey::generate(crypto);
        Self::new(hex::encode(channel), &key, bootstrap)
    }

    /// Session key
    pub fn shared_key(&self) -> SharedKey {
        SharedKey::from_bytes(self.key)
    }

    /// Text form
    pub fn encode(&self) -> MasqResult<String> {
        let bytes = postcard::to_allocvec(self)?;
        Ok(format!("{}{}", LINK_PREFIX, bs58::encode(bytes).into_string()))
    }

    /// Parse the text form.
    pub fn decode(s: &str) -> MasqResult<Self> {
        let body = s
            .trim()
            .strip_prefix(LINK_PREFIX)
            .ok_or_else(|| MasqError::InvalidLink(format!("Missing '{}' prefix", LINK_PREFIX)))?;
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| MasqError::InvalidLink(format!("Invalid base58: {}", e)))?;
        let link: PairingLink = postcard::from_bytes(&bytes)
            .map_err(|e| MasqError::InvalidLink(format!("Invalid link payload: {}", e)))?;

        if link.version != LINK_VERSION {
            return Err(MasqError::InvalidLink(format!(
                "Unsupported link version {}",
                link.version
            )));
        }
        if link.channel.is_empty() {
            return Err(MasqError::InvalidLink("Empty channel".to_string()));
        }
        Ok(link)
    }
}
