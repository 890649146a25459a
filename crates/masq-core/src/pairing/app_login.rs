//! Flow A: a third-party app logs in to the user's device.
//!
//! ```text
//! Device (MasqLogin)                       App (AppLogin)
//!   |--- notAuthorized --------------------->|
//!   |<-- registerUserApp{name, ...} ---------|
//!   |    ask the user                        |
//!   |--- masqAccessGranted{key, dbId} ------>|   or masqAccessRefused
//!   |<-- requestWriteAccess{key} ------------|
//!   |    authorize key on the app store      |
//!   |--- writeAccessGranted ---------------->|
//!   |--- authorized{dbId} ------------------>|
//!   |<-- connectionEstablished --------------|
//! ```

use super::machine::{reject, Effect, Flow, Input, PairingOutcome, StoreKind, Transition};
use super::message::PairingMessage;
use crate::error::ProtocolError;
use crate::types::AppRequest;

/// Device side of app login
#[derive(Debug, Clone, Copy, Default)]
pub struct MasqLogin;

/// [`MasqLogin`] states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasqLoginState {
    /// Waiting for the app to connect
    Idle,
    /// Challenge sent, waiting for `registerUserApp`
    AwaitingAppInfo,
    /// Waiting for the user
    AwaitingUserConsent(AppRequest),
    /// Opening the app store
    ProvisioningStore(AppRequest),
    /// Key sent, waiting for the app's writer key
    AwaitingWriteAccessRequest {
        /// App store name
        db_id: String,
    },
    /// Authorizing the app's writer key
    Authorizing {
        /// App store name
        db_id: String,
    },
    /// `authorized` sent, waiting for the acknowledgement
    Authorized {
        /// App store name
        db_id: String,
    },
    /// Login complete
    Done {
        /// App store name
        db_id: String,
    },
    /// The user refused
    Refused,
    /// The user did not answer in time
    Abandoned,
}

impl Flow for MasqLogin {
    type State = MasqLoginState;

    fn name(&self) -> &'static str {
        "masq-login"
    }

    fn initial(&self) -> MasqLoginState {
        MasqLoginState::Idle
    }

    fn transition(
        &self,
        state: MasqLoginState,
        input: Input,
    ) -> Result<(MasqLoginState, Transition), ProtocolError> {
        use MasqLoginState as S;
        use PairingMessage as M;

        let label = self.label(&state);
        Ok(match (state, input) {
            (S::Idle, Input::Connected) => {
                (S::AwaitingAppInfo, Transition::send(M::NotAuthorized))
            }

            (
                S::AwaitingAppInfo,
                Input::Message(M::RegisterUserApp {
                    name,
                    description,
                    image_url,
                }),
            ) => {
                if name.trim().is_empty() {
                    return Err(ProtocolError::Malformed("App name is empty".to_string()));
                }
                let request = AppRequest {
                    name,
                    description,
                    image: image_url,
                };
                (
                    S::AwaitingUserConsent(request.clone()),
                    Transition::effect(Effect::RequestConsent(request)),
                )
            }

            (S::AwaitingUserConsent(_), Input::Consent(false)) => {
                (S::Refused, Transition::send(M::MasqAccessRefused))
            }
            (S::AwaitingUserConsent(_), Input::TimedOut) => {
                (S::Abandoned, Transition::send(M::MasqAccessRefused))
            }
            (S::AwaitingUserConsent(request), Input::Consent(true)) => {
                let name = request.name.clone();
                (
                    S::ProvisioningStore(request),
                    Transition::effect(Effect::OpenAppStore { name }),
                )
            }

            (S::ProvisioningStore(request), Input::StoreOpened { key, db_id }) => (
                S::AwaitingWriteAccessRequest {
                    db_id: db_id.clone(),
                },
                Transition::effect(Effect::RegisterApp {
                    db_id: db_id.clone(),
                    app: request.to_app(key.clone()),
                })
                .and_send(M::MasqAccessGranted {
                    key,
                    user_app_db_id: db_id,
                }),
            ),

            (S::AwaitingWriteAccessRequest { db_id }, Input::Message(M::RequestWriteAccess { key })) => (
                S::Authorizing {
                    db_id: db_id.clone(),
                },
                Transition::effect(Effect::AuthorizeWriter { db_id, key }),
            ),

            (S::Authorizing { db_id }, Input::WriterAuthorized) => (
                S::Authorized {
                    db_id: db_id.clone(),
                },
                Transition::effect(Effect::Replicate {
                    db_id: db_id.clone(),
                })
                .and_send(M::WriteAccessGranted)
                .and_send(M::Authorized {
                    user_app_db_id: db_id,
                }),
            ),

            // The grant is already in the store; a missing ack does not undo it
            (
                S::Authorized { db_id },
                Input::Message(M::ConnectionEstablished) | Input::PeerClosed | Input::TimedOut,
            ) => (S::Done { db_id }, Transition::none()),

            (_, input) => return Err(reject(label, input)),
        })
    }

    fn outcome(&self, state: &MasqLoginState) -> Option<PairingOutcome> {
        match state {
            MasqLoginState::Done { db_id } => Some(PairingOutcome::Granted {
                db_id: db_id.clone(),
            }),
            MasqLoginState::Refused => Some(PairingOutcome::Refused),
            MasqLoginState::Abandoned => Some(PairingOutcome::Abandoned),
            _ => None,
        }
    }

    fn label(&self, state: &MasqLoginState) -> &'static str {
        match state {
            MasqLoginState::Idle => "Idle",
            MasqLoginState::AwaitingAppInfo => "AwaitingAppInfo",
            MasqLoginState::AwaitingUserConsent(_) => "AwaitingUserConsent",
            MasqLoginState::ProvisioningStore(_) => "ProvisioningStore",
            MasqLoginState::AwaitingWriteAccessRequest { .. } => "AwaitingWriteAccessRequest",
            MasqLoginState::Authorizing { .. } => "Authorizing",
            MasqLoginState::Authorized { .. } => "Authorized",
            MasqLoginState::Done { .. } => "Done",
            MasqLoginState::Refused => "Refused",
            MasqLoginState::Abandoned => "Abandoned",
        }
    }
}

/// App side of app login
#[derive(Debug, Clone)]
pub struct AppLogin {
    /// What the app presents to the user
    pub app: AppRequest,
}

/// [`AppLogin`] states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppLoginState {
    /// Waiting for the device to connect
    Idle,
    /// Waiting for `notAuthorized`
    AwaitingChallenge,
    /// Registered; the user is deciding
    AwaitingGrant,
    /// Opening the granted store
    JoiningStore {
        /// Store name
        db_id: String,
    },
    /// Writer key sent
    AwaitingWriteGrant {
        /// Store name
        db_id: String,
    },
    /// Waiting for `authorized`
    AwaitingAuthorized {
        /// Store name
        db_id: String,
    },
    /// Login complete
    Done {
        /// Store name
        db_id: String,
    },
    /// Access refused
    Refused,
}

impl Flow for AppLogin {
    type State = AppLoginState;

    fn name(&self) -> &'static str {
        "app-login"
    }

    fn initial(&self) -> AppLoginState {
        AppLoginState::Idle
    }

    fn transition(
        &self,
        state: AppLoginState,
        input: Input,
    ) -> Result<(AppLoginState, Transition), ProtocolError> {
        use AppLoginState as S;
        use PairingMessage as M;

        let label = self.label(&state);
        Ok(match (state, input) {
            (S::Idle, Input::Connected) => (S::AwaitingChallenge, Transition::none()),

            (S::AwaitingChallenge, Input::Message(M::NotAuthorized)) => (
                S::AwaitingGrant,
                Transition::send(M::RegisterUserApp {
                    name: self.app.name.clone(),
                    description: self.app.description.clone(),
                    image_url: self.app.image.clone(),
                }),
            ),

            (S::AwaitingGrant, Input::Message(M::MasqAccessRefused)) => {
                (S::Refused, Transition::none())
            }
            (
                S::AwaitingGrant,
                Input::Message(M::MasqAccessGranted {
                    key,
                    user_app_db_id,
                }),
            ) => (
                S::JoiningStore {
                    db_id: user_app_db_id.clone(),
                },
                Transition::effect(Effect::JoinStore {
                    kind: StoreKind::App,
                    key,
                    db_id: user_app_db_id,
                }),
            ),

            (S::JoiningStore { db_id }, Input::LocalWriter { key }) => (
                S::AwaitingWriteGrant { db_id },
                Transition::send(M::RequestWriteAccess { key }),
            ),

            (S::AwaitingWriteGrant { db_id }, Input::Message(M::WriteAccessGranted)) => {
                (S::AwaitingAuthorized { db_id }, Transition::none())
            }

            (S::AwaitingAuthorized { db_id }, Input::Message(M::Authorized { user_app_db_id })) => {
                if user_app_db_id != db_id {
                    return Err(ProtocolError::Malformed(format!(
                        "authorized for '{}' but granted '{}'",
                        user_app_db_id, db_id
                    )));
                }
                (
                    S::Done {
                        db_id: db_id.clone(),
                    },
                    Transition::effect(Effect::Replicate { db_id })
                        .and_send(M::ConnectionEstablished),
                )
            }

            (_, input) => return Err(reject(label, input)),
        })
    }

    fn outcome(&self, state: &AppLoginState) -> Option<PairingOutcome> {
        match state {
            AppLoginState::Done { db_id } => Some(PairingOutcome::Granted {
                db_id: db_id.clone(),
            }),
            AppLoginState::Refused => Some(PairingOutcome::Refused),
            _ => None,
        }
    }

    fn label(&self, state: &AppLoginState) -> &'static str {
        match state {
            AppLoginState::Idle => "Idle",
            AppLoginState::AwaitingChallenge => "AwaitingChallenge",
            AppLoginState::AwaitingGrant => "AwaitingGrant",
            AppLoginState::JoiningStore { .. } => "JoiningStore",
            AppLoginState::AwaitingWriteGrant { .. } => "AwaitingWriteGrant",
            AppLoginState::AwaitingAuthorized { .. } => "AwaitingAuthorized",
            AppLoginState::Done { .. } => "Done",
            AppLoginState::Refused => "Refused",
        }
    }

    fn awaits_human(&self, state: &AppLoginState) -> bool {
        matches!(state, AppLoginState::AwaitingGrant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> AppRequest {
        AppRequest {
            name: "Notes".into(),
            description: "Take notes".into(),
            image: "https://example.com/n.png".into(),
        }
    }

    fn register() -> Input {
        Input::Message(PairingMessage::RegisterUserApp {
            name: "Notes".into(),
            description: "Take notes".into(),
            image_url: "https://example.com/n.png".into(),
        })
    }

    /// Run inputs through a flow, collecting every transition
    fn run<F: Flow>(flow: &F, inputs: Vec<Input>) -> (F::State, Vec<Transition>) {
        let mut state = flow.initial();
        let mut out = Vec::new();
        for input in inputs {
            let (next, t) = flow.transition(state, input).unwrap();
            state = next;
            out.push(t);
        }
        (state, out)
    }

    #[test]
    fn test_device_happy_path() {
        let flow = MasqLogin;
        let (state, steps) = run(
            &flow,
            vec![
                Input::Connected,
                register(),
                Input::Consent(true),
                Input::StoreOpened {
                    key: "aa".into(),
                    db_id: "p-Notes".into(),
                },
                Input::Message(PairingMessage::RequestWriteAccess { key: "bb".into() }),
                Input::WriterAuthorized,
                Input::Message(PairingMessage::ConnectionEstablished),
            ],
        );

        assert_eq!(steps[0].outgoing, vec![PairingMessage::NotAuthorized]);
        assert_eq!(steps[1].effects, vec![Effect::RequestConsent(notes())]);
        assert_eq!(
            steps[2].effects,
            vec![Effect::OpenAppStore {
                name: "Notes".into()
            }]
        );
        assert_eq!(
            steps[3].outgoing,
            vec![PairingMessage::MasqAccessGranted {
                key: "aa".into(),
                user_app_db_id: "p-Notes".into()
            }]
        );
        assert!(matches!(
            &steps[3].effects[0],
            Effect::RegisterApp { app, .. } if app.store_key.as_deref() == Some("aa")
        ));
        assert_eq!(
            steps[4].effects,
            vec![Effect::AuthorizeWriter {
                db_id: "p-Notes".into(),
                key: "bb".into()
            }]
        );
        assert_eq!(
            steps[5].outgoing,
            vec![
                PairingMessage::WriteAccessGranted,
                PairingMessage::Authorized {
                    user_app_db_id: "p-Notes".into()
                }
            ]
        );
        assert_eq!(
            flow.outcome(&state),
            Some(PairingOutcome::Granted {
                db_id: "p-Notes".into()
            })
        );
    }

    #[test]
    fn test_device_refusal_sends_refused() {
        let flow = MasqLogin;
        let (state, steps) = run(
            &flow,
            vec![Input::Connected, register(), Input::Consent(false)],
        );
        assert_eq!(steps[2].outgoing, vec![PairingMessage::MasqAccessRefused]);
        assert!(steps[2].effects.is_empty());
        assert_eq!(flow.outcome(&state), Some(PairingOutcome::Refused));
    }

    #[test]
    fn test_device_consent_timeout_abandons() {
        let flow = MasqLogin;
        let (state, steps) = run(&flow, vec![Input::Connected, register(), Input::TimedOut]);
        assert_eq!(steps[2].outgoing, vec![PairingMessage::MasqAccessRefused]);
        assert_eq!(flow.outcome(&state), Some(PairingOutcome::Abandoned));
    }

    #[test]
    fn test_device_rejects_early_write_request() {
        let flow = MasqLogin;
        let (state, _) = run(&flow, vec![Input::Connected]);
        let err = flow
            .transition(
                state,
                Input::Message(PairingMessage::RequestWriteAccess { key: "bb".into() }),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedMessage {
                state: "AwaitingAppInfo".into(),
                msg: "requestWriteAccess".into()
            }
        );
    }

    #[test]
    fn test_device_peer_gone_before_grant_fails() {
        let flow = MasqLogin;
        let (state, _) = run(
            &flow,
            vec![
                Input::Connected,
                register(),
                Input::Consent(true),
                Input::StoreOpened {
                    key: "aa".into(),
                    db_id: "p-Notes".into(),
                },
            ],
        );
        let err = flow.transition(state, Input::PeerClosed).unwrap_err();
        assert!(matches!(err, ProtocolError::PeerClosed(_)));
    }

    #[test]
    fn test_device_missing_ack_still_completes() {
        let flow = MasqLogin;
        let state = MasqLoginState::Authorized {
            db_id: "p-Notes".into(),
        };
        let (state, _) = flow.transition(state, Input::TimedOut).unwrap();
        assert!(matches!(flow.outcome(&state), Some(PairingOutcome::Granted { .. })));
    }

    #[test]
    fn test_device_rejects_empty_name() {
        let flow = MasqLogin;
        let err = flow
            .transition(
                MasqLoginState::AwaitingAppInfo,
                Input::Message(PairingMessage::RegisterUserApp {
                    name: " ".into(),
                    description: String::new(),
                    image_url: String::new(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_app_happy_path() {
        let flow = AppLogin { app: notes() };
        let (state, steps) = run(
            &flow,
            vec![
                Input::Connected,
                Input::Message(PairingMessage::NotAuthorized),
                Input::Message(PairingMessage::MasqAccessGranted {
                    key: "aa".into(),
                    user_app_db_id: "p-Notes".into(),
                }),
                Input::LocalWriter { key: "bb".into() },
                Input::Message(PairingMessage::WriteAccessGranted),
                Input::Message(PairingMessage::Authorized {
                    user_app_db_id: "p-Notes".into(),
                }),
            ],
        );

        assert!(steps[0].outgoing.is_empty());
        assert!(matches!(
            &steps[1].outgoing[0],
            PairingMessage::RegisterUserApp { name, .. } if name == "Notes"
        ));
        assert_eq!(
            steps[2].effects,
            vec![Effect::JoinStore {
                kind: StoreKind::App,
                key: "aa".into(),
                db_id: "p-Notes".into()
            }]
        );
        assert_eq!(
            steps[3].outgoing,
            vec![PairingMessage::RequestWriteAccess { key: "bb".into() }]
        );
        assert_eq!(steps[5].outgoing, vec![PairingMessage::ConnectionEstablished]);
        assert_eq!(
            flow.outcome(&state),
            Some(PairingOutcome::Granted {
                db_id: "p-Notes".into()
            })
        );
    }

    #[test]
    fn test_app_waits_on_human_only_while_registered() {
        let flow = AppLogin { app: notes() };
        assert!(!flow.awaits_human(&AppLoginState::AwaitingChallenge));
        assert!(flow.awaits_human(&AppLoginState::AwaitingGrant));
    }

    #[test]
    fn test_app_refused() {
        let flow = AppLogin { app: notes() };
        let (state, _) = run(
            &flow,
            vec![
                Input::Connected,
                Input::Message(PairingMessage::NotAuthorized),
                Input::Message(PairingMessage::MasqAccessRefused),
            ],
        );
        assert_eq!(flow.outcome(&state), Some(PairingOutcome::Refused));
    }

    #[test]
    fn test_app_rejects_mismatched_authorized() {
        let flow = AppLogin { app: notes() };
        let err = flow
            .transition(
                AppLoginState::AwaitingAuthorized {
                    db_id: "p-Notes".into(),
                },
                Input::Message(PairingMessage::Authorized {
                    user_app_db_id: "p-Other".into(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
