//! Flow C: the device provisions a fresh store for a new app.
//!
//! No consent prompt: the device user started this flow and handed the
//! link to the app.
//!
//! ```text
//! Device (Provision)                       App (ProvisionRequest)
//!   open or reuse the app store, then join
//!   |--- sendDataKey{key} ------------------>|
//!   |<-- appInfo{name, ...} -----------------|
//!   |    record the app on the profile       |
//!   |<-- requestWriteAccess{key} ------------|
//!   |    authorize key on the app store      |
//!   |--- ready ----------------------------->|
//! ```

use super::machine::{reject, Effect, Flow, Input, PairingOutcome, StoreKind, Transition};
use super::message::PairingMessage;
use crate::error::ProtocolError;
use crate::types::AppRequest;

/// Device side of provisioning.
///
/// The app store is opened before the flow starts, so the key is known up
/// front and is sent as soon as the app connects.
#[derive(Debug, Clone)]
pub struct Provision {
    /// Name of the app being provisioned
    pub app_name: String,
    /// App store name
    pub db_id: String,
    /// App store public key (hex)
    pub key: String,
}

/// [`Provision`] states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    /// Store open, waiting for the app to connect
    AppStoreReady,
    /// Key sent, waiting for `appInfo`
    KeyAdvertised,
    /// Waiting for the app's writer key
    AwaitingWriteAccessRequest,
    /// Authorizing the app's writer key
    Authorizing,
    /// Provisioning complete
    Authorized,
}

impl Flow for Provision {
    type State = ProvisionState;

    fn name(&self) -> &'static str {
        "provision"
    }

    fn initial(&self) -> ProvisionState {
        ProvisionState::AppStoreReady
    }

    fn transition(
        &self,
        state: ProvisionState,
        input: Input,
    ) -> Result<(ProvisionState, Transition), ProtocolError> {
        use PairingMessage as M;
        use ProvisionState as S;

        let label = self.label(&state);
        Ok(match (state, input) {
            (S::AppStoreReady, Input::Connected) => (
                S::KeyAdvertised,
                Transition::send(M::SendDataKey {
                    key: self.key.clone(),
                }),
            ),

            (
                S::KeyAdvertised,
                Input::Message(M::AppInfo {
                    name,
                    description,
                    image,
                }),
            ) => {
                if name != self.app_name {
                    return Err(ProtocolError::Malformed(format!(
                        "Provisioned '{}' but app calls itself '{}'",
                        self.app_name, name
                    )));
                }
                let app = AppRequest {
                    name,
                    description,
                    image,
                }
                .to_app(self.key.clone());
                (
                    S::AwaitingWriteAccessRequest,
                    Transition::effect(Effect::RegisterApp {
                        db_id: self.db_id.clone(),
                        app,
                    }),
                )
            }

            (S::AwaitingWriteAccessRequest, Input::Message(M::RequestWriteAccess { key })) => (
                S::Authorizing,
                Transition::effect(Effect::AuthorizeWriter {
                    db_id: self.db_id.clone(),
                    key,
                }),
            ),

            (S::Authorizing, Input::WriterAuthorized) => (
                S::Authorized,
                Transition::effect(Effect::Replicate {
                    db_id: self.db_id.clone(),
                })
                .and_send(M::Ready),
            ),

            (_, input) => return Err(reject(label, input)),
        })
    }

    fn outcome(&self, state: &ProvisionState) -> Option<PairingOutcome> {
        match state {
            ProvisionState::Authorized => Some(PairingOutcome::Granted {
                db_id: self.db_id.clone(),
            }),
            _ => None,
        }
    }

    fn label(&self, state: &ProvisionState) -> &'static str {
        match state {
            ProvisionState::AppStoreReady => "AppStoreReady",
            ProvisionState::KeyAdvertised => "KeyAdvertised",
            ProvisionState::AwaitingWriteAccessRequest => "AwaitingWriteAccessRequest",
            ProvisionState::Authorizing => "Authorizing",
            ProvisionState::Authorized => "Authorized",
        }
    }
}

/// App side of provisioning
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// What the app presents
    pub app: AppRequest,
    /// Local name for the provisioned store
    pub store_name: String,
}

/// [`ProvisionRequest`] states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionRequestState {
    /// Waiting for the device to connect
    Idle,
    /// Waiting for `sendDataKey`
    AwaitingDataKey,
    /// Opening the replica
    JoiningStore,
    /// Writer key sent, waiting for `ready`
    AwaitingReady,
    /// Provisioning complete
    Ready,
}

impl Flow for ProvisionRequest {
    type State = ProvisionRequestState;

    fn name(&self) -> &'static str {
        "provision-request"
    }

    fn initial(&self) -> ProvisionRequestState {
        ProvisionRequestState::Idle
    }

    fn transition(
        &self,
        state: ProvisionRequestState,
        input: Input,
    ) -> Result<(ProvisionRequestState, Transition), ProtocolError> {
        use PairingMessage as M;
        use ProvisionRequestState as S;

        let label = self.label(&state);
        Ok(match (state, input) {
            (S::Idle, Input::Connected) => (S::AwaitingDataKey, Transition::none()),

            (S::AwaitingDataKey, Input::Message(M::SendDataKey { key })) => (
                S::JoiningStore,
                Transition::effect(Effect::JoinStore {
                    kind: StoreKind::App,
                    key,
                    db_id: self.store_name.clone(),
                })
                .and_send(M::AppInfo {
                    name: self.app.name.clone(),
                    description: self.app.description.clone(),
                    image: self.app.image.clone(),
                }),
            ),

            (S::JoiningStore, Input::LocalWriter { key }) => (
                S::AwaitingReady,
                Transition::send(M::RequestWriteAccess { key }),
            ),

            (S::AwaitingReady, Input::Message(M::Ready)) => (
                S::Ready,
                Transition::effect(Effect::Replicate {
                    db_id: self.store_name.clone(),
                }),
            ),

            (_, input) => return Err(reject(label, input)),
        })
    }

    fn outcome(&self, state: &ProvisionRequestState) -> Option<PairingOutcome> {
        match state {
            ProvisionRequestState::Ready => Some(PairingOutcome::Granted {
                db_id: self.store_name.clone(),
            }),
            _ => None,
        }
    }

    fn label(&self, state: &ProvisionRequestState) -> &'static str {
        match state {
            ProvisionRequestState::Idle => "Idle",
            ProvisionRequestState::AwaitingDataKey => "AwaitingDataKey",
            ProvisionRequestState::JoiningStore => "JoiningStore",
            ProvisionRequestState::AwaitingReady => "AwaitingReady",
            ProvisionRequestState::Ready => "Ready",
        }
    }
}
