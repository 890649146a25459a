//! Async driver for pairing flows.
//!
//! One task per session: wait for the peer on the swarm channel, then loop
//! feeding inputs to the flow, running its effects through a
//! [`PairingHost`], and sending its messages sealed with the session key.
//! Every wait is bounded and the swarm session is closed on every exit.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::machine::{Effect, Flow, Input, PairingOutcome, StoreKind};
use super::message::PairingMessage;
use crate::config::PairingConfig;
use crate::crypto::{CryptoChannel, Envelope, SharedCrypto, SharedKey};
use crate::error::{MasqError, MasqResult, ProtocolError};
use crate::store::StoreKey;
use crate::swarm::{PeerConnection, SwarmSession};
use crate::types::{App, AppRequest};

/// How long to wait for the peer to close after the flow has ended
const LINGER: Duration = Duration::from_secs(2);

/// Bounds on every wait a session makes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingOptions {
    /// Consent prompt, and reads that depend on the other side's user
    pub consent_timeout: Duration,
    /// Every other read
    pub round_trip_timeout: Duration,
    /// Waiting for the peer to join the channel
    pub connect_timeout: Duration,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self::from(&PairingConfig::default())
    }
}

impl From<&PairingConfig> for PairingOptions {
    fn from(config: &PairingConfig) -> Self {
        Self {
            consent_timeout: config.consent_timeout(),
            round_trip_timeout: config.round_trip_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

fn unsupported(what: &str) -> MasqError {
    MasqError::InvalidOperation(format!("{} is not available on this side", what))
}

/// Performs the effects a flow asks for.
///
/// Device and app sides each implement only what their flows use.
#[async_trait]
pub trait PairingHost: Send + Sync {
    /// Ask the user to admit an app.
    async fn request_consent(&self, _request: &AppRequest) -> MasqResult<bool> {
        Err(unsupported("consent"))
    }

    /// Create or reuse an app's store; returns its key and name.
    async fn open_app_store(&self, _app_name: &str) -> MasqResult<(StoreKey, String)> {
        Err(unsupported("app store provisioning"))
    }

    /// Record an app on the open profile.
    async fn register_app(&self, _db_id: &str, _app: App) -> MasqResult<()> {
        Err(unsupported("app registration"))
    }

    /// Authorize a writer key on a store.
    async fn authorize_writer(&self, _db_id: &str, _key: &str) -> MasqResult<()> {
        Err(unsupported("writer authorization"))
    }

    /// Open a replica of a remote store; returns the local writer key.
    async fn join_store(&self, _kind: StoreKind, _key: &str, _db_id: &str) -> MasqResult<StoreKey> {
        Err(unsupported("joining a store"))
    }

    /// Start background replication of a store.
    async fn replicate(&self, db_id: &str) -> MasqResult<()>;
}

/// Run `flow` over the first peer to join `session`.
///
/// The session is closed when this returns, whatever the result.
pub async fn run_flow<F: Flow>(
    flow: &F,
    mut session: SwarmSession,
    key: &SharedKey,
    host: &dyn PairingHost,
    options: &PairingOptions,
    crypto: SharedCrypto,
    cancel: CancellationToken,
) -> MasqResult<PairingOutcome> {
    let span = info_span!("pairing", flow = flow.name(), channel = %session.channel());
    let result = async {
        tokio::select! {
            result = drive(flow, &mut session, key, host, options, crypto) => result,
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled.into()),
        }
    }
    .instrument(span)
    .await;

    session.close();
    match &result {
        Ok(outcome) => info!(flow = flow.name(), ?outcome, "Pairing finished"),
        Err(e) => warn!(flow = flow.name(), error = %e, "Pairing failed"),
    }
    result
}

async fn drive<F: Flow>(
    flow: &F,
    session: &mut SwarmSession,
    key: &SharedKey,
    host: &dyn PairingHost,
    options: &PairingOptions,
    crypto: SharedCrypto,
) -> MasqResult<PairingOutcome> {
    let peer = match timeout(options.connect_timeout, session.next_peer()).await {
        Err(_) => return Err(ProtocolError::Timeout("waiting for peer".to_string()).into()),
        Ok(peer) => peer?.ok_or_else(|| {
            MasqError::Transport("Session closed before a peer joined".to_string())
        })?,
    };
    info!(peer = %peer.peer_id, "Peer connected");

    let mut conn = peer.conn;
    let channel = CryptoChannel::new(key, crypto);
    let mut state = flow.initial();
    let mut inputs = VecDeque::from([Input::Connected]);

    loop {
        while let Some(input) = inputs.pop_front() {
            let kind = input.kind();
            let (next, transition) = flow.transition(state, input)?;
            debug!(input = kind, state = flow.label(&next), "Transition");
            state = next;

            for effect in transition.effects {
                if let Some(input) = run_effect(effect, host, options).await? {
                    inputs.push_back(input);
                }
            }

            let terminal = flow.outcome(&state).is_some();
            for msg in &transition.outgoing {
                match send(&mut conn, &channel, msg).await {
                    Ok(()) => {}
                    // The peer may already be gone once we are done
                    Err(e) if terminal => {
                        debug!(msg = msg.kind(), error = %e, "Final message not delivered");
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(outcome) = flow.outcome(&state) {
                linger(&mut conn).await;
                return Ok(outcome);
            }
        }

        let wait = if flow.awaits_human(&state) {
            options.consent_timeout
        } else {
            options.round_trip_timeout
        };
        let input = match timeout(wait, conn.recv()).await {
            Err(_) => Input::TimedOut,
            Ok(Ok(None)) => Input::PeerClosed,
            Ok(Ok(Some(frame))) => Input::Message(open(&channel, &frame)?),
            Ok(Err(e)) => return Err(e),
        };
        inputs.push_back(input);
    }
}

async fn run_effect(
    effect: Effect,
    host: &dyn PairingHost,
    options: &PairingOptions,
) -> MasqResult<Option<Input>> {
    debug!(?effect, "Running effect");
    Ok(match effect {
        Effect::RequestConsent(request) => {
            info!(app = %request.name, "Waiting for user consent");
            match timeout(options.consent_timeout, host.request_consent(&request)).await {
                Ok(granted) => Some(Input::Consent(granted?)),
                Err(_) => {
                    warn!(app = %request.name, "Consent timed out");
                    Some(Input::TimedOut)
                }
            }
        }
        Effect::OpenAppStore { name } => {
            let (key, db_id) = host.open_app_store(&name).await?;
            Some(Input::StoreOpened {
                key: key.to_hex(),
                db_id,
            })
        }
        Effect::RegisterApp { db_id, app } => {
            host.register_app(&db_id, app).await?;
            None
        }
        Effect::AuthorizeWriter { db_id, key } => {
            host.authorize_writer(&db_id, &key).await?;
            Some(Input::WriterAuthorized)
        }
        Effect::JoinStore { kind, key, db_id } => {
            let local = host.join_store(kind, &key, &db_id).await?;
            Some(Input::LocalWriter {
                key: local.to_hex(),
            })
        }
        Effect::Replicate { db_id } => {
            host.replicate(&db_id).await?;
            None
        }
    })
}

async fn send(
    conn: &mut PeerConnection,
    channel: &CryptoChannel,
    msg: &PairingMessage,
) -> MasqResult<()> {
    debug!(msg = msg.kind(), "Sending");
    let envelope = channel.seal(msg)?;
    conn.send(envelope.to_bytes()?).await
}

fn open(channel: &CryptoChannel, frame: &[u8]) -> Result<PairingMessage, ProtocolError> {
    let envelope = Envelope::from_bytes(frame)?;
    let msg: PairingMessage = channel.open(&envelope)?;
    debug!(msg = msg.kind(), "Received");
    Ok(msg)
}

/// Finish our side and give the peer a moment to read and close theirs.
async fn linger(conn: &mut PeerConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Close after pairing failed");
        return;
    }
    let _ = timeout(LINGER, async {
        while let Ok(Some(_)) = conn.recv().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::os_crypto;
    use crate::pairing::app_login::{AppLogin, MasqLogin};
    use crate::pairing::consent::{ConsentPrompt, StaticConsent};
    use crate::swarm::{MemoryHub, Rendezvous};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Device host that records what it was asked to do
    struct RecordingHost {
        consent: Box<dyn ConsentPrompt>,
        authorized: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PairingHost for RecordingHost {
        async fn request_consent(&self, request: &AppRequest) -> MasqResult<bool> {
            self.consent.ask(request).await
        }

        async fn open_app_store(&self, app_name: &str) -> MasqResult<(StoreKey, String)> {
            Ok((StoreKey([1; 32]), format!("p-{}", app_name)))
        }

        async fn register_app(&self, _db_id: &str, _app: App) -> MasqResult<()> {
            Ok(())
        }

        async fn authorize_writer(&self, _db_id: &str, key: &str) -> MasqResult<()> {
            self.authorized.lock().push(key.to_string());
            Ok(())
        }

        async fn replicate(&self, _db_id: &str) -> MasqResult<()> {
            Ok(())
        }
    }

    struct AppHost;

    #[async_trait]
    impl PairingHost for AppHost {
        async fn join_store(&self, _kind: StoreKind, _key: &str, _db_id: &str) -> MasqResult<StoreKey> {
            Ok(StoreKey([2; 32]))
        }

        async fn replicate(&self, _db_id: &str) -> MasqResult<()> {
            Ok(())
        }
    }

    fn fast() -> PairingOptions {
        PairingOptions {
            consent_timeout: Duration::from_millis(300),
            round_trip_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn notes() -> AppRequest {
        AppRequest {
            name: "Notes".into(),
            ..Default::default()
        }
    }

    async fn login(
        consent: Box<dyn ConsentPrompt>,
        device_key: SharedKey,
        app_key: SharedKey,
    ) -> (
        MasqResult<PairingOutcome>,
        MasqResult<PairingOutcome>,
        Arc<RecordingHost>,
    ) {
        let hub = MemoryHub::new();
        let device = hub.node("device").join("login").await.unwrap();
        let app = hub.node("app").join("login").await.unwrap();
        let host = Arc::new(RecordingHost {
            consent,
            authorized: Mutex::new(Vec::new()),
        });

        let opts = fast();
        let device_host = host.clone();
        let device_task = tokio::spawn(async move {
            run_flow(
                &MasqLogin,
                device,
                &device_key,
                device_host.as_ref(),
                &opts,
                os_crypto(),
                CancellationToken::new(),
            )
            .await
        });
        let app_result = run_flow(
            &AppLogin { app: notes() },
            app,
            &app_key,
            &AppHost,
            &opts,
            os_crypto(),
            CancellationToken::new(),
        )
        .await;
        (device_task.await.unwrap(), app_result, host)
    }

    #[tokio::test]
    async fn test_login_granted() {
        let key = SharedKey::from_bytes([5; 32]);
        let (device, app, host) = login(Box::new(StaticConsent(true)), key.clone(), key).await;

        let granted = PairingOutcome::Granted {
            db_id: "p-Notes".into(),
        };
        assert_eq!(device.unwrap(), granted);
        assert_eq!(app.unwrap(), granted);
        assert_eq!(*host.authorized.lock(), vec![StoreKey([2; 32]).to_hex()]);
    }

    #[tokio::test]
    async fn test_login_refused() {
        let key = SharedKey::from_bytes([5; 32]);
        let (device, app, host) = login(Box::new(StaticConsent(false)), key.clone(), key).await;
        assert_eq!(device.unwrap(), PairingOutcome::Refused);
        assert_eq!(app.unwrap(), PairingOutcome::Refused);
        assert!(host.authorized.lock().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let (device, app, host) = login(
            Box::new(StaticConsent(true)),
            SharedKey::from_bytes([5; 32]),
            SharedKey::from_bytes([6; 32]),
        )
        .await;

        assert!(matches!(
            app.unwrap_err(),
            MasqError::Protocol(ProtocolError::Authentication)
        ));
        assert!(matches!(device.unwrap_err(), MasqError::Protocol(_)));
        assert!(host.authorized.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_peer_times_out() {
        let hub = MemoryHub::new();
        let session = hub.node("device").join("empty").await.unwrap();
        let token = session.cancel_token();
        let mut opts = fast();
        opts.connect_timeout = Duration::from_millis(50);

        let result = run_flow(
            &MasqLogin,
            session,
            &SharedKey::from_bytes([5; 32]),
            &AppHost,
            &opts,
            os_crypto(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(MasqError::Protocol(ProtocolError::Timeout(_)))
        ));
        assert!(token.is_cancelled());
        assert_eq!(hub.members("empty"), 0);
    }

    #[tokio::test]
    async fn test_cancel_closes_session() {
        let hub = MemoryHub::new();
        let session = hub.node("device").join("cancel").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_flow(
            &MasqLogin,
            session,
            &SharedKey::from_bytes([5; 32]),
            &AppHost,
            &fast(),
            os_crypto(),
            cancel,
        )
        .await;
        assert!(matches!(
            result,
            Err(MasqError::Protocol(ProtocolError::Cancelled))
        ));
        assert_eq!(hub.members("cancel"), 0);
    }
}
