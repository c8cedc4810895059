//! Bridge Client: the operator-side process that dials the relay's
//! `/bridge` route and forwards messages into (and replies out of) a local
//! agent loop.
//!
//! The reconnect/backoff algorithm is ported directly from
//! `bridge/client.py`'s `_connect_with_retry`: start at 5s, double on each
//! consecutive failure, cap at 30s, reset to 5s on a successful
//! authenticated connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{ClientToRelay, RelayToClient};

const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 30;

/// The narrow seam this binary integrates an external agent loop through:
/// one inbound `(chat_id, sender, content)` in, zero or more
/// `(chat_id, content)` replies out.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, chat_id: &str, sender: &str, content: &str) -> Vec<(String, String)>;
}

/// Minimal built-in responder for standalone operation and testing: it
/// just echoes the inbound content back to the same chat.
pub struct EchoResponder;

#[async_trait]
impl AgentHandler for EchoResponder {
    async fn handle(&self, chat_id: &str, _sender: &str, content: &str) -> Vec<(String, String)> {
        vec![(chat_id.to_string(), format!("echo: {content}"))]
    }
}

pub struct BridgeClient {
    relay_url: String,
    bridge_token: String,
    agent: Arc<dyn AgentHandler>,
    running: AtomicBool,
}

impl BridgeClient {
    pub fn new(relay_url: impl Into<String>, bridge_token: impl Into<String>, agent: Arc<dyn AgentHandler>) -> Arc<Self> {
        Arc::new(Self {
            relay_url: relay_url.into(),
            bridge_token: bridge_token.into(),
            agent,
            running: AtomicBool::new(true),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the reconnect loop until `stop()` is called. Never returns an
    /// error — every connection failure is absorbed into the backoff and
    /// retried.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF_SECS;

        while self.is_running() {
            match self.connect_and_serve().await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF_SECS;
                }
                Err(err) => {
                    tracing::warn!(error = %err, backoff, "bridge connection lost");
                }
            }

            if !self.is_running() {
                break;
            }

            tracing::info!(backoff, "reconnecting to relay");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect_and_serve(&self) -> Result<(), super::BridgeError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.relay_url)
            .await
            .map_err(|e| super::BridgeError::Io(std::io::Error::other(e.to_string())))?;

        let auth = ClientToRelay::BridgeAuth { bridge_token: self.bridge_token.clone() };
        ws.send(Message::Text(serde_json::to_string(&auth).expect("serializes")))
            .await
            .map_err(|e| super::BridgeError::Io(std::io::Error::other(e.to_string())))?;

        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<RelayToClient>(&text) {
                    Ok(RelayToClient::BridgeAuthSuccess) => {
                        tracing::info!("bridge authenticated with relay");
                    }
                    _ => return Err(super::BridgeError::AuthFailed),
                }
            }
            _ => return Err(super::BridgeError::AuthFailed),
        }

        while self.is_running() {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.handle_relay_message(&mut ws, &text).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(super::BridgeError::Io(std::io::Error::other(e.to_string())));
                }
            }
        }

        Ok(())
    }

    async fn handle_relay_message(
        &self,
        ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        text: &str,
    ) -> Result<(), super::BridgeError> {
        match serde_json::from_str::<RelayToClient>(text) {
            Ok(RelayToClient::BridgeMessage { device_id, sender, chat_id, content }) => {
                // chat_id is always device_id on this channel; see DESIGN.md.
                debug_assert_eq!(chat_id, device_id);
                let replies = self.agent.handle(&chat_id, &sender, &content).await;
                for (reply_chat_id, reply_content) in replies {
                    let response = ClientToRelay::BridgeResponse {
                        device_id: reply_chat_id,
                        content: reply_content,
                    };
                    let json = serde_json::to_string(&response).expect("serializes");
                    ws.send(Message::Text(json))
                        .await
                        .map_err(|e| super::BridgeError::Io(std::io::Error::other(e.to_string())))?;
                }
            }
            Ok(RelayToClient::BridgePing) => {
                ws.send(Message::Text(
                    serde_json::to_string(&ClientToRelay::BridgePong).expect("serializes"),
                ))
                .await
                .map_err(|e| super::BridgeError::Io(std::io::Error::other(e.to_string())))?;
            }
            Ok(RelayToClient::Error { message }) => {
                tracing::warn!(%message, "relay reported an error");
            }
            Ok(RelayToClient::BridgeAuthSuccess) | Err(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_responder_replies_on_same_chat() {
        let responder = EchoResponder;
        let replies = responder.handle("device-1", "device-1", "hi").await;
        assert_eq!(replies, vec![("device-1".to_string(), "echo: hi".to_string())]);
    }

    #[test]
    fn backoff_doubles_and_caps_at_thirty() {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut seen = vec![backoff];
        for _ in 0..5 {
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            seen.push(backoff);
        }
        assert_eq!(seen, vec![5, 10, 20, 30, 30, 30]);
    }
}
