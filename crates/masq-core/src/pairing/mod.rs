//! Pairing and authorization protocol.
//!
//! Three flows run over an ephemeral swarm channel, every message sealed
//! with a key shared out of band through a [`PairingLink`]:
//!
//! - app login ([`MasqLogin`] on the device, [`AppLogin`] in the app)
//! - device sync ([`DeviceSync`], owner or joiner)
//! - app provisioning ([`Provision`] on the device, [`ProvisionRequest`] in the app)
//!
//! Each flow is a pure state machine ([`Flow`]); [`run_flow`] drives one
//! over a connection. Any failure closes the session without granting.

pub mod app_login;
pub mod client;
pub mod consent;
pub mod device_sync;
pub mod link;
pub mod machine;
pub mod message;
pub mod provision;
pub mod session;

pub use app_login::{AppLogin, MasqLogin};
pub use client::AppClient;
pub use consent::{ChannelConsent, ConsentPrompt, ConsentRequest, StaticConsent};
pub use device_sync::{DeviceSync, SyncRole};
pub use link::PairingLink;
pub use machine::{Effect, Flow, Input, PairingOutcome, StoreKind, Transition};
pub use message::PairingMessage;
pub use provision::{Provision, ProvisionRequest};
pub use session::{run_flow, PairingHost, PairingOptions};
