//! Masq Core Library
//!
//! Local-first profiles, apps, and devices, synchronized peer-to-peer.
//!
//! ## Overview
//!
//! Every profile and every app lives in its own replicated store: an
//! append-only, signed log per writer, merged into a key/value view. A store
//! only accepts entries from writers its owner has authorized. New writers
//! are admitted through a pairing protocol run over an ephemeral swarm
//! channel, with every message sealed by a key shared out of band.
//!
//! ## Core Principles
//!
//! - **Local-first**: all reads and writes hit local storage
//! - **Fail closed**: any pairing error ends the session without a grant
//! - **Explicit consent**: third-party apps are admitted only when the user says so
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use masq_core::{Masq, MasqConfig, MemoryHub, NewProfile, StaticConsent, os_crypto};
//! use masq_core::store::MemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let masq = Masq::new(
//!         MasqConfig::default(),
//!         MemoryBackend::shared(),
//!         Arc::new(hub.node("laptop")),
//!         Arc::new(StaticConsent(true)),
//!         os_crypto(),
//!     );
//!
//!     let profile = masq
//!         .add_profile(NewProfile {
//!             username: "jdoe".into(),
//!             passphrase: "s3cret-pass".into(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     masq.open_profile(&profile.id, "s3cret-pass").await?;
//!
//!     // Hand this to an app, then wait for it to log in
//!     let link = masq.new_link();
//!     println!("{}", link.encode()?);
//!     masq.handle_user_app_login(&link).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod masq;
pub mod pairing;
pub mod registry;
pub mod replication;
pub mod store;
pub mod swarm;
pub mod types;
pub mod validators;

// Re-exports
pub use config::MasqConfig;
pub use crypto::{os_crypto, CryptoChannel, CryptoProvider, SharedCrypto, SharedKey};
pub use error::{MasqError, MasqResult, ProtocolError};
pub use masq::{node_secret, open_backend, Masq};
pub use pairing::{
    AppClient, ChannelConsent, ConsentPrompt, PairingLink, PairingOptions, PairingOutcome,
    StaticConsent,
};
pub use registry::{LocalIndex, ResourceRegistry};
pub use replication::ReplicationManager;
pub use store::{ReplicatedStore, StoreKey, StoreRegistry};
pub use swarm::{IrohRendezvous, MemoryHub, MemoryRendezvous, NodeAddrBytes, Rendezvous};
pub use types::{App, AppRequest, Device, NewProfile, Profile, PublicProfile};
