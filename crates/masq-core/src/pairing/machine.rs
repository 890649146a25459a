//! Shared vocabulary of the pairing state machines.
//!
//! A flow is a pure function from `(state, input)` to the next state plus a
//! [`Transition`] listing messages to send and effects to run. The driver in
//! [`session`](super::session) performs the I/O and feeds the results back
//! in as further inputs, so every flow can be exercised without a transport.

use std::fmt;

use super::message::PairingMessage;
use crate::error::ProtocolError;
use crate::types::{App, AppRequest};

/// Which kind of store a [`Effect::JoinStore`] opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// A user's profile store
    Profile,
    /// An app's private store
    App,
}

/// Something that happened to a pairing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The peer is connected
    Connected,
    /// A decrypted message from the peer
    Message(PairingMessage),
    /// The user answered the consent prompt
    Consent(bool),
    /// An app store is open and ready
    StoreOpened {
        /// Store public key (hex)
        key: String,
        /// Store name
        db_id: String,
    },
    /// A writer key was authorized
    WriterAuthorized,
    /// A remote store is open locally; this is our writer key
    LocalWriter {
        /// Writer public key (hex)
        key: String,
    },
    /// The peer closed the connection
    PeerClosed,
    /// A bounded wait expired
    TimedOut,
}

impl Input {
    /// Short name used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Input::Connected => "connected",
            Input::Message(msg) => msg.kind(),
            Input::Consent(_) => "consent",
            Input::StoreOpened { .. } => "storeOpened",
            Input::WriterAuthorized => "writerAuthorized",
            Input::LocalWriter { .. } => "localWriter",
            Input::PeerClosed => "peerClosed",
            Input::TimedOut => "timedOut",
        }
    }
}

/// Work the driver performs on a flow's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask the user whether to admit an app; answers with [`Input::Consent`]
    RequestConsent(AppRequest),
    /// Create or reuse the app's store; answers with [`Input::StoreOpened`]
    OpenAppStore {
        /// App name
        name: String,
    },
    /// Record the app on the open profile
    RegisterApp {
        /// Store the app was granted
        db_id: String,
        /// App record
        app: App,
    },
    /// Authorize a writer key; answers with [`Input::WriterAuthorized`]
    AuthorizeWriter {
        /// Store to authorize on
        db_id: String,
        /// Writer public key (hex)
        key: String,
    },
    /// Open a replica of a remote store; answers with [`Input::LocalWriter`]
    JoinStore {
        /// Profile or app store
        kind: StoreKind,
        /// Store public key (hex)
        key: String,
        /// Local store name
        db_id: String,
    },
    /// Start background replication of a store
    Replicate {
        /// Store name
        db_id: String,
    },
}

/// Output of one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Messages to send, in order
    pub outgoing: Vec<PairingMessage>,
    /// Effects to run, in order, before the messages are sent
    pub effects: Vec<Effect>,
}

impl Transition {
    /// Nothing to do
    pub fn none() -> Self {
        Self::default()
    }

    /// Send one message
    pub fn send(msg: PairingMessage) -> Self {
        Self::none().and_send(msg)
    }

    /// Run one effect
    pub fn effect(effect: Effect) -> Self {
        Self::none().and_effect(effect)
    }

    /// Also send `msg`
    pub fn and_send(mut self, msg: PairingMessage) -> Self {
        self.outgoing.push(msg);
        self
    }

    /// Also run `effect`
    pub fn and_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// How a completed flow ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Write access was granted on `db_id`
    Granted {
        /// Store the grant applies to
        db_id: String,
    },
    /// The user (or the device, on the user's behalf) refused
    Refused,
    /// The consent prompt was not answered in time
    Abandoned,
}

/// A pairing flow for one role.
pub trait Flow: Send + Sync {
    /// Flow state
    type State: fmt::Debug + Send;

    /// Flow name, for logs
    fn name(&self) -> &'static str;

    /// State before the peer connects
    fn initial(&self) -> Self::State;

    /// Advance by one input.
    fn transition(
        &self,
        state: Self::State,
        input: Input,
    ) -> Result<(Self::State, Transition), ProtocolError>;

    /// Terminal result, once reached
    fn outcome(&self, state: &Self::State) -> Option<PairingOutcome>;

    /// State name, for errors and logs
    fn label(&self, state: &Self::State) -> &'static str;

    /// Whether the next message depends on a human on the other side
    fn awaits_human(&self, _state: &Self::State) -> bool {
        false
    }
}

/// Error for an input the current state does not accept.
///
/// A closed peer or an expired wait outside a terminal state is a failure,
/// never a grant.
pub(crate) fn reject(state: &'static str, input: Input) -> ProtocolError {
    match input {
        Input::PeerClosed => ProtocolError::PeerClosed(state.to_string()),
        Input::TimedOut => ProtocolError::Timeout(state.to_string()),
        other => ProtocolError::UnexpectedMessage {
            state: state.to_string(),
            msg: other.kind().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_maps_inputs() {
        assert_eq!(
            reject("AwaitingAppInfo", Input::PeerClosed),
            ProtocolError::PeerClosed("AwaitingAppInfo".into())
        );
        assert_eq!(
            reject("AwaitingAppInfo", Input::TimedOut),
            ProtocolError::Timeout("AwaitingAppInfo".into())
        );
        assert_eq!(
            reject("Idle", Input::Message(PairingMessage::Ready)),
            ProtocolError::UnexpectedMessage {
                state: "Idle".into(),
                msg: "ready".into()
            }
        );
    }

    #[test]
    fn test_transition_builders() {
        let t = Transition::send(PairingMessage::NotAuthorized).and_effect(Effect::Replicate {
            db_id: "p".into(),
        });
        assert_eq!(t.outgoing, vec![PairingMessage::NotAuthorized]);
        assert_eq!(t.effects.len(), 1);
        assert_eq!(Transition::none(), Transition::default());
    }
}
