//! Human consent for app login.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::MasqResult;
use crate::types::AppRequest;

/// Asks the user whether an app may access their profile.
///
/// Implementations may block for as long as the user takes; the pairing
/// driver bounds the wait.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// `true` to admit the app
    async fn ask(&self, request: &AppRequest) -> MasqResult<bool>;
}

/// Always gives the same answer
#[derive(Debug, Clone, Copy)]
pub struct StaticConsent(pub bool);

#[async_trait]
impl ConsentPrompt for StaticConsent {
    async fn ask(&self, _request: &AppRequest) -> MasqResult<bool> {
        Ok(self.0)
    }
}

/// A pending consent decision handed to a UI
#[derive(Debug)]
pub struct ConsentRequest {
    /// The app asking
    pub app: AppRequest,
    reply: oneshot::Sender<bool>,
}

impl ConsentRequest {
    /// Answer the request
    pub fn respond(self, granted: bool) {
        let _ = self.reply.send(granted);
    }
}

/// Forwards prompts to a UI over a channel.
///
/// A UI that goes away without answering counts as a refusal.
#[derive(Debug, Clone)]
pub struct ChannelConsent {
    tx: mpsc::Sender<ConsentRequest>,
}

impl ChannelConsent {
    /// Create the prompt and the receiver the UI reads from
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConsentRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConsentPrompt for ChannelConsent {
    async fn ask(&self, request: &AppRequest) -> MasqResult<bool> {
        let (reply, answer) = oneshot::channel();
        let pending = ConsentRequest {
            app: request.clone(),
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            warn!(app = %request.name, "No consent UI listening, refusing");
            return Ok(false);
        }
        Ok(answer.await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> AppRequest {
        AppRequest {
            name: "Notes".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_static() {
        assert!(StaticConsent(true).ask(&notes()).await.unwrap());
        assert!(!StaticConsent(false).ask(&notes()).await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (prompt, mut rx) = ChannelConsent::new(1);
        let ui = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.app.name, "Notes");
            request.respond(true);
        });
        assert!(prompt.ask(&notes()).await.unwrap());
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_ui_refuses() {
        let (prompt, rx) = ChannelConsent::new(1);
        drop(rx);
        assert!(!prompt.ask(&notes()).await.unwrap());

        let (prompt, mut rx) = ChannelConsent::new(1);
        let ui = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            drop(request);
        });
        assert!(!prompt.ask(&notes()).await.unwrap());
        ui.await.unwrap();
    }
}
