//! Pairing message catalogue.
//!
//! Every message is a JSON object discriminated by `msg`, sealed in an
//! [`Envelope`](crate::crypto::Envelope) before it goes on the wire:
//!
//! ```text
//! {"msg":"masqAccessGranted","key":"9f2c…","userAppDbId":"01H…-Notes"}
//! ```

use serde::{Deserialize, Serialize};

/// One pairing protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PairingMessage {
    /// Opening challenge from the device in app login
    NotAuthorized,

    /// App asks to be registered on the user's profile
    RegisterUserApp {
        /// App display name
        name: String,
        /// Free text
        #[serde(default)]
        description: String,
        /// Icon URL
        #[serde(default)]
        image_url: String,
    },

    /// User accepted; carries the app store key
    MasqAccessGranted {
        /// App store public key (hex)
        key: String,
        /// Store name on the device
        user_app_db_id: String,
    },

    /// User refused or did not answer
    MasqAccessRefused,

    /// App presents its writer key
    RequestWriteAccess {
        /// Writer public key (hex)
        key: String,
    },

    /// Writer key authorized on the app store
    WriteAccessGranted,

    /// Login complete
    Authorized {
        /// Store name on the device
        user_app_db_id: String,
    },

    /// App acknowledges `authorized`
    ConnectionEstablished,

    /// Liveness check in device sync
    MasqAppSyncProfile,

    /// Owner advertises the profile store
    MasqAppAccessGranted {
        /// Profile store public key (hex)
        key: String,
        /// Profile the store belongs to
        profile_id: String,
    },

    /// Joining device presents its writer key
    MasqAppRequestWriteAccess {
        /// Writer public key (hex)
        key: String,
    },

    /// Joining device authorized on the profile store
    MasqAppWriteAccessGranted,

    /// Device advertises a freshly provisioned app store
    SendDataKey {
        /// App store public key (hex)
        key: String,
    },

    /// App metadata sent during provisioning
    AppInfo {
        /// App display name
        name: String,
        /// Free text
        #[serde(default)]
        description: String,
        /// Icon URL
        #[serde(default)]
        image: String,
    },

    /// Provisioning complete
    Ready,
}

impl PairingMessage {
    /// Wire discriminator, as it appears in `msg`
    pub fn kind(&self) -> &'static str {
        match self {
            PairingMessage::NotAuthorized => "notAuthorized",
            PairingMessage::RegisterUserApp { .. } => "registerUserApp",
            PairingMessage::MasqAccessGranted { .. } => "masqAccessGranted",
            PairingMessage::MasqAccessRefused => "masqAccessRefused",
            PairingMessage::RequestWriteAccess { .. } => "requestWriteAccess",
            PairingMessage::WriteAccessGranted => "writeAccessGranted",
            PairingMessage::Authorized { .. } => "authorized",
            PairingMessage::ConnectionEstablished => "connectionEstablished",
            PairingMessage::MasqAppSyncProfile => "masqAppSyncProfile",
            PairingMessage::MasqAppAccessGranted { .. } => "masqAppAccessGranted",
            PairingMessage::MasqAppRequestWriteAccess { .. } => "masqAppRequestWriteAccess",
            PairingMessage::MasqAppWriteAccessGranted => "masqAppWriteAccessGranted",
            PairingMessage::SendDataKey { .. } => "sendDataKey",
            PairingMessage::AppInfo { .. } => "appInfo",
            PairingMessage::Ready => "ready",
        }
    }
}
