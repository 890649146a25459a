//! Portable peer addresses for links and config.

use std::net::SocketAddr;

use iroh::{EndpointAddr, PublicKey, RelayUrl};
use serde::{Deserialize, Serialize};

use crate::error::MasqError;

/// Serializable form of an iroh endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddrBytes {
    /// Endpoint public key
    pub node_id: [u8; 32],
    /// Relay used for NAT traversal
    pub relay_url: Option<String>,
    /// Direct socket addresses, e.g. `192.168.1.1:4433`
    pub direct_addresses: Vec<String>,
}

impl NodeAddrBytes {
    /// Address with only a node id
    pub fn new(node_id: [u8; 32]) -> Self {
        Self {
            node_id,
            relay_url: None,
            direct_addresses: Vec::new(),
        }
    }

    /// Set the relay URL
    pub fn with_relay(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    /// Add a direct address
    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.direct_addresses.push(addr.into());
        self
    }

    /// Capture an iroh address
    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        Self {
            node_id: addr.id.as_bytes().to_owned(),
            relay_url: addr.relay_urls().next().map(|url| url.to_string()),
            direct_addresses: addr.ip_addrs().map(|a| a.to_string()).collect(),
        }
    }

    /// Rebuild the iroh address.
    pub fn to_endpoint_addr(&self) -> Result<EndpointAddr, MasqError> {
        let public_key = PublicKey::from_bytes(&self.node_id)
            .map_err(|e| MasqError::InvalidLink(format!("Invalid node id: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref relay_str) = self.relay_url {
            let relay_url: RelayUrl = relay_str
                .parse()
                .map_err(|e| MasqError::InvalidLink(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }

        for addr_str in &self.direct_addresses {
            let socket_addr: SocketAddr = addr_str
                .parse()
                .map_err(|e| MasqError::InvalidLink(format!("Invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket_addr);
        }

        Ok(addr)
    }

    /// Compact text form, `base58(postcard)`, used in config files
    pub fn to_ticket(&self) -> Result<String, MasqError> {
        Ok(bs58::encode(postcard::to_allocvec(self)?).into_string())
    }

    /// Parse the form produced by [`to_ticket`](Self::to_ticket).
    pub fn from_ticket(s: &str) -> Result<Self, MasqError> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| MasqError::InvalidLink(format!("Invalid base58: {}", e)))?;
        postcard::from_bytes(&bytes)
            .map_err(|e| MasqError::InvalidLink(format!("Invalid peer address: {}", e)))
    }
}

impl From<&EndpointAddr> for NodeAddrBytes {
    fn from(addr: &EndpointAddr) -> Self {
        Self::from_endpoint_addr(addr)
    }
}

impl TryFrom<&NodeAddrBytes> for EndpointAddr {
    type Error = MasqError;

    fn try_from(bytes: &NodeAddrBytes) -> Result<Self, Self::Error> {
        bytes.to_endpoint_addr()
    }
}
