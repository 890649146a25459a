//! Runtime configuration, loaded from `<data_dir>/masq.json`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::KdfParams;
use crate::error::MasqResult;
use crate::swarm::NodeAddrBytes;

/// Config file name inside the data directory
pub const CONFIG_FILE: &str = "masq.json";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasqConfig {
    /// Pairing timeouts
    pub pairing: PairingConfig,
    /// Passphrase hashing cost
    pub kdf: KdfParams,
    /// Rendezvous settings
    pub network: NetworkConfig,
}

/// Pairing timeouts, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// How long a consent prompt may stay unanswered
    pub consent_timeout_secs: u64,
    /// Bound on each protocol round-trip
    pub round_trip_timeout_secs: u64,
    /// How long to wait for the other side to show up on the channel
    pub connect_timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            consent_timeout_secs: 120,
            round_trip_timeout_secs: 30,
            connect_timeout_secs: 120,
        }
    }
}

impl PairingConfig {
    /// Consent wait bound
    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }

    /// Round-trip bound
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_secs(self.round_trip_timeout_secs)
    }

    /// Peer arrival bound
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Rendezvous settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peer addresses in [`NodeAddrBytes::to_ticket`] form
    pub bootstrap: Vec<String>,
}

impl NetworkConfig {
    /// Parse the bootstrap list.
    pub fn bootstrap_peers(&self) -> MasqResult<Vec<NodeAddrBytes>> {
        self.bootstrap
            .iter()
            .map(|s| NodeAddrBytes::from_ticket(s))
            .collect()
    }
}

impl MasqConfig {
    /// Load from `data_dir`, falling back to defaults when the file is absent.
    pub fn load(data_dir: impl AsRef<Path>) -> MasqResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write to `data_dir`, creating it if needed.
    pub fn save(&self, data_dir: impl AsRef<Path>) -> MasqResult<()> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
