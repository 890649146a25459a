//! Flow B: another of the user's devices joins a profile.
//!
//! The owner holds the profile store and advertises it; the joiner asks for
//! write access with its own writer key. Which side speaks first is set by
//! the `initiator` flag; the non-initiator opens with a liveness probe:
//!
//! ```text
//! Owner                                    Joiner
//!   |<-- masqAppSyncProfile ---------------->|   (from the non-initiator;
//!   |                                        |    an initiating joiner echoes it)
//!   |--- masqAppAccessGranted{key, pid} ---->|
//!   |<-- masqAppRequestWriteAccess{key} -----|
//!   |    authorize key on the profile store  |
//!   |--- masqAppWriteAccessGranted --------->|
//! ```
//!
//! Repeated probes are ignored once a side has moved past waiting for one,
//! so a retransmitted probe never leads to a second grant.

use super::machine::{reject, Effect, Flow, Input, PairingOutcome, StoreKind, Transition};
use super::message::PairingMessage;
use crate::error::ProtocolError;

/// Which side of the profile this device is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRole {
    /// Holds the profile store and grants access
    Owner {
        /// Profile id, also the profile store name
        profile_id: String,
        /// Profile store public key (hex)
        key: String,
    },
    /// Asks for access
    Joiner,
}

/// Device sync for one role
#[derive(Debug, Clone)]
pub struct DeviceSync {
    /// This side's role
    pub role: SyncRole,
    /// Whether this side waits for the first probe
    pub initiator: bool,
}

/// [`DeviceSync`] states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSyncState {
    /// Waiting for the peer
    Idle,
    /// Waiting for the peer's probe
    AwaitingProbe,
    /// Owner: key sent, waiting for the joiner's writer key
    KeyAdvertised,
    /// Owner: authorizing the joiner
    Authorizing,
    /// Joiner: waiting for the profile key
    AwaitingKey,
    /// Joiner: opening the profile replica
    JoiningStore {
        /// Profile id
        profile_id: String,
    },
    /// Joiner: writer key sent
    WriteAccessRequested {
        /// Profile id
        profile_id: String,
    },
    /// Access granted
    Synced {
        /// Profile id
        profile_id: String,
    },
}

impl DeviceSync {
    fn advertise(&self) -> Result<(DeviceSyncState, Transition), ProtocolError> {
        match &self.role {
            SyncRole::Owner { profile_id, key } => Ok((
                DeviceSyncState::KeyAdvertised,
                Transition::send(PairingMessage::MasqAppAccessGranted {
                    key: key.clone(),
                    profile_id: profile_id.clone(),
                }),
            )),
            SyncRole::Joiner => Err(ProtocolError::UnexpectedMessage {
                state: "AwaitingProbe".to_string(),
                msg: "advertise".to_string(),
            }),
        }
    }

    fn owner_profile(&self) -> Option<&str> {
        match &self.role {
            SyncRole::Owner { profile_id, .. } => Some(profile_id),
            SyncRole::Joiner => None,
        }
    }
}

impl Flow for DeviceSync {
    type State = DeviceSyncState;

    fn name(&self) -> &'static str {
        match self.role {
            SyncRole::Owner { .. } => "device-sync-owner",
            SyncRole::Joiner => "device-sync-joiner",
        }
    }

    fn initial(&self) -> DeviceSyncState {
        DeviceSyncState::Idle
    }

    fn transition(
        &self,
        state: DeviceSyncState,
        input: Input,
    ) -> Result<(DeviceSyncState, Transition), ProtocolError> {
        use DeviceSyncState as S;
        use PairingMessage as M;

        let label = self.label(&state);
        let owner = self.owner_profile().map(str::to_string);

        Ok(match (state, input, owner) {
            (S::Idle, Input::Connected, Some(_)) if self.initiator => {
                (S::AwaitingProbe, Transition::none())
            }
            (S::Idle, Input::Connected, Some(_)) => {
                (S::AwaitingProbe, Transition::send(M::MasqAppSyncProfile))
            }
            (S::Idle, Input::Connected, None) if self.initiator => {
                (S::AwaitingProbe, Transition::none())
            }
            (S::Idle, Input::Connected, None) => {
                (S::AwaitingKey, Transition::send(M::MasqAppSyncProfile))
            }

            (S::AwaitingProbe, Input::Message(M::MasqAppSyncProfile), Some(_)) => {
                self.advertise()?
            }
            (S::AwaitingProbe, Input::Message(M::MasqAppSyncProfile), None) => {
                (S::AwaitingKey, Transition::send(M::MasqAppSyncProfile))
            }

            // Retransmitted probes
            (S::KeyAdvertised, Input::Message(M::MasqAppSyncProfile), Some(_)) => {
                (S::KeyAdvertised, Transition::none())
            }
            (S::AwaitingKey, Input::Message(M::MasqAppSyncProfile), None) => {
                (S::AwaitingKey, Transition::none())
            }

            (S::KeyAdvertised, Input::Message(M::MasqAppRequestWriteAccess { key }), Some(profile_id)) => (
                S::Authorizing,
                Transition::effect(Effect::AuthorizeWriter {
                    db_id: profile_id,
                    key,
                }),
            ),
            (S::Authorizing, Input::WriterAuthorized, Some(profile_id)) => (
                S::Synced {
                    profile_id: profile_id.clone(),
                },
                Transition::effect(Effect::Replicate { db_id: profile_id })
                    .and_send(M::MasqAppWriteAccessGranted),
            ),

            (S::AwaitingKey, Input::Message(M::MasqAppAccessGranted { key, profile_id }), None) => {
                if profile_id.is_empty() {
                    return Err(ProtocolError::Malformed("Empty profile id".to_string()));
                }
                (
                    S::JoiningStore {
                        profile_id: profile_id.clone(),
                    },
                    Transition::effect(Effect::JoinStore {
                        kind: StoreKind::Profile,
                        key,
                        db_id: profile_id,
                    }),
                )
            }
            (S::JoiningStore { profile_id }, Input::LocalWriter { key }, None) => (
                S::WriteAccessRequested { profile_id },
                Transition::send(M::MasqAppRequestWriteAccess { key }),
            ),
            (S::WriteAccessRequested { profile_id }, Input::Message(M::MasqAppWriteAccessGranted), None) => (
                S::Synced {
                    profile_id: profile_id.clone(),
                },
                Transition::effect(Effect::Replicate { db_id: profile_id }),
            ),

            (_, input, _) => return Err(reject(label, input)),
        })
    }

    fn outcome(&self, state: &DeviceSyncState) -> Option<PairingOutcome> {
        match state {
            DeviceSyncState::Synced { profile_id } => Some(PairingOutcome::Granted {
                db_id: profile_id.clone(),
            }),
            _ => None,
        }
    }

    fn label(&self, state: &DeviceSyncState) -> &'static str {
        match state {
            DeviceSyncState::Idle => "Idle",
            DeviceSyncState::AwaitingProbe => "AwaitingProbe",
            DeviceSyncState::KeyAdvertised => "KeyAdvertised",
            DeviceSyncState::Authorizing => "Authorizing",
            DeviceSyncState::AwaitingKey => "AwaitingKey",
            DeviceSyncState::JoiningStore { .. } => "JoiningStore",
            DeviceSyncState::WriteAccessRequested { .. } => "WriteAccessRequested",
            DeviceSyncState::Synced { .. } => "Synced",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn owner(initiator: bool) -> DeviceSync {
        DeviceSync {
            role: SyncRole::Owner {
                profile_id: "01HPROFILE".into(),
                key: "aa".into(),
            },
            initiator,
        }
    }

    fn joiner(initiator: bool) -> DeviceSync {
        DeviceSync {
            role: SyncRole::Joiner,
            initiator,
        }
    }

    /// Drive both machines against each other, answering effects inline.
    /// Returns the final states and how many authorizations the owner ran.
    fn converge(
        owner: &DeviceSync,
        joiner: &DeviceSync,
        duplicate_probes: bool,
    ) -> Result<(DeviceSyncState, DeviceSyncState, usize), ProtocolError> {
        let mut o_state = owner.initial();
        let mut j_state = joiner.initial();
        let mut to_owner: VecDeque<Input> = VecDeque::from([Input::Connected]);
        let mut to_joiner: VecDeque<Input> = VecDeque::from([Input::Connected]);
        let mut authorizations = 0;

        for _ in 0..64 {
            if let Some(input) = to_owner.pop_front() {
                let (next, t) = owner.transition(o_state, input)?;
                o_state = next;
                for effect in t.effects {
                    if let Effect::AuthorizeWriter { .. } = effect {
                        authorizations += 1;
                        to_owner.push_back(Input::WriterAuthorized);
                    }
                }
                for msg in t.outgoing {
                    to_joiner.push_back(Input::Message(msg));
                }
            }
            if let Some(input) = to_joiner.pop_front() {
                let (next, t) = joiner.transition(j_state, input)?;
                j_state = next;
                for effect in t.effects {
                    if let Effect::JoinStore { .. } = effect {
                        to_joiner.push_back(Input::LocalWriter { key: "bb".into() });
                    }
                }
                for msg in t.outgoing {
                    if duplicate_probes && msg == PairingMessage::MasqAppSyncProfile {
                        to_owner.push_back(Input::Message(msg.clone()));
                    }
                    to_owner.push_back(Input::Message(msg));
                }
            }
            if owner.outcome(&o_state).is_some() && joiner.outcome(&j_state).is_some() {
                break;
            }
        }
        Ok((o_state, j_state, authorizations))
    }

    #[test]
    fn test_converges_for_every_initiator_setting() {
        for (o_init, j_init) in [(true, false), (false, true), (false, false)] {
            let (o, j, auths) = converge(&owner(o_init), &joiner(j_init), false).unwrap();
            let expected = DeviceSyncState::Synced {
                profile_id: "01HPROFILE".into(),
            };
            assert_eq!(o, expected, "owner initiator={}", o_init);
            assert_eq!(j, expected, "joiner initiator={}", j_init);
            assert_eq!(auths, 1);
        }
    }

    #[test]
    fn test_retransmitted_probe_authorizes_once() {
        for (o_init, j_init) in [(true, false), (false, true), (false, false)] {
            let (o, _, auths) = converge(&owner(o_init), &joiner(j_init), true).unwrap();
            assert!(matches!(o, DeviceSyncState::Synced { .. }));
            assert_eq!(auths, 1);
        }
    }

    #[test]
    fn test_both_initiators_stall() {
        let (o, j, auths) = converge(&owner(true), &joiner(true), false).unwrap();
        assert_eq!(o, DeviceSyncState::AwaitingProbe);
        assert_eq!(j, DeviceSyncState::AwaitingProbe);
        assert_eq!(auths, 0);

        let err = owner(true).transition(o, Input::TimedOut).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_owner_rejects_advertisement() {
        let flow = owner(false);
        let err = flow
            .transition(
                DeviceSyncState::AwaitingProbe,
                Input::Message(PairingMessage::MasqAppAccessGranted {
                    key: "cc".into(),
                    profile_id: "x".into(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }

    #[test]
    fn test_joiner_rejects_write_request() {
        let flow = joiner(false);
        let err = flow
            .transition(
                DeviceSyncState::AwaitingKey,
                Input::Message(PairingMessage::MasqAppRequestWriteAccess { key: "cc".into() }),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }

    #[test]
    fn test_owner_advertises_profile_id() {
        let flow = owner(true);
        let (state, _) = flow.transition(DeviceSyncState::Idle, Input::Connected).unwrap();
        let (state, t) = flow
            .transition(state, Input::Message(PairingMessage::MasqAppSyncProfile))
            .unwrap();
        assert_eq!(state, DeviceSyncState::KeyAdvertised);
        assert_eq!(
            t.outgoing,
            vec![PairingMessage::MasqAppAccessGranted {
                key: "aa".into(),
                profile_id: "01HPROFILE".into()
            }]
        );
    }
}
