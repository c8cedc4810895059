//! Bridge Tunnel: the relay side of the single-tenant `/bridge` WebSocket.
//!
//! At most one authenticated bridge is held at a time. A second connection
//! attempt is rejected outright; the existing bridge is left untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::gateway::{DownstreamSink, MobileGateway};

use super::protocol::{
    ClientToRelay, RelayToClient, CLOSE_ALREADY_CONNECTED, CLOSE_AUTH_FAILED,
    KEEPALIVE_INTERVAL_SECS,
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("a bridge is already connected")]
    AlreadyConnected,

    #[error("bridge authentication failed")]
    AuthFailed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const OFFLINE_NOTICE: &str =
    "Agent is currently offline. The local bridge is not connected. Please try again later.";

struct BridgeSlot {
    outbound: mpsc::Sender<RelayToClient>,
}

pub struct BridgeTunnel {
    bridge_token: String,
    gateway: Arc<MobileGateway>,
    slot: Mutex<Option<BridgeSlot>>,
}

impl BridgeTunnel {
    pub fn new(bridge_token: String, gateway: Arc<MobileGateway>) -> Arc<Self> {
        Arc::new(Self { bridge_token, gateway, slot: Mutex::new(None) })
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    fn token_matches(&self, candidate: &str) -> bool {
        let expected = self.bridge_token.as_bytes();
        let actual = candidate.as_bytes();
        if expected.len() != actual.len() {
            return false;
        }
        expected.ct_eq(actual).into()
    }

    /// Deliver a mobile message to the connected bridge; if none is
    /// connected, synthesize the offline notice back to the originating
    /// device instead.
    async fn forward_or_notify(&self, device_id: &str, sender: &str, chat_id: &str, content: &str) {
        let outbound = {
            let slot = self.slot.lock().await;
            slot.as_ref().map(|s| s.outbound.clone())
        };

        match outbound {
            Some(tx) => {
                let msg = RelayToClient::BridgeMessage {
                    device_id: device_id.to_string(),
                    sender: sender.to_string(),
                    chat_id: chat_id.to_string(),
                    content: content.to_string(),
                };
                if tx.send(msg).await.is_err() {
                    tracing::warn!(device_id = %device_id, "bridge outbound channel closed");
                }
            }
            None => {
                if !self.gateway.send_to_device(device_id, OFFLINE_NOTICE) {
                    tracing::warn!(device_id = %device_id, "could not deliver offline notice: device not connected");
                }
            }
        }
    }

    /// Deliver a `bridge_response` back to the named mobile device.
    async fn deliver_response(&self, device_id: &str, content: &str) {
        if !self.gateway.send_to_device(device_id, content) {
            tracing::warn!(device_id = %device_id, "bridge_response delivery failed: device not connected");
        }
    }
}

#[async_trait]
impl DownstreamSink for BridgeTunnel {
    async fn forward(&self, device_id: &str, sender: &str, chat_id: &str, content: &str) {
        self.forward_or_notify(device_id, sender, chat_id, content).await;
    }
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(tunnel): State<Arc<BridgeTunnel>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, tunnel))
}

async fn handle_connection(socket: WebSocket, tunnel: Arc<BridgeTunnel>) {
    let (mut sink, mut stream) = socket.split();

    if tunnel.is_connected().await {
        tracing::warn!("rejecting second bridge connection");
        let _ = sink
            .send(Message::Text(
                RelayToClient::Error { message: "Another bridge is already connected".to_string() }.to_json(),
            ))
            .await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ALREADY_CONNECTED,
                reason: "already connected".into(),
            })))
            .await;
        return;
    }

    // Authenticate before registering the singleton slot.
    let first = match stream.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };

    let authed = match serde_json::from_str::<ClientToRelay>(&first) {
        Ok(ClientToRelay::BridgeAuth { bridge_token }) => tunnel.token_matches(&bridge_token),
        _ => false,
    };

    if !authed {
        tracing::warn!("bridge authentication failed");
        let _ = sink
            .send(Message::Text(
                RelayToClient::Error { message: "Authentication failed".to_string() }.to_json(),
            ))
            .await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_AUTH_FAILED,
                reason: "auth failed".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<RelayToClient>(64);
    {
        let mut slot = tunnel.slot.lock().await;
        *slot = Some(BridgeSlot { outbound: tx.clone() });
    }
    let _ = tx.send(RelayToClient::BridgeAuthSuccess).await;
    tracing::info!("bridge authenticated");

    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientToRelay>(&text) {
                            Ok(ClientToRelay::BridgeResponse { device_id, content }) => {
                                tunnel.deliver_response(&device_id, &content).await;
                            }
                            Ok(ClientToRelay::BridgePong) => {}
                            Ok(ClientToRelay::BridgeAuth { .. }) => {
                                let _ = tx.send(RelayToClient::Error {
                                    message: "Unknown message type: bridge_auth".to_string(),
                                }).await;
                            }
                            Err(_) => {
                                let _ = tx.send(RelayToClient::Error {
                                    message: "Unknown message type".to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = keepalive.tick() => {
                let _ = tx.send(RelayToClient::BridgePing).await;
            }
        }
    }

    drop(tx);
    let _ = sender_handle.await;
    *tunnel.slot.lock().await = None;
    tracing::info!("bridge disconnected");
}
