//! Per-connection WebSocket state machine: UNAUTH → AUTH.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, ServerMessage};
use super::MobileGateway;

const OUTBOUND_BUFFER: usize = 64;
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(PartialEq, Eq, Clone, Copy)]
enum ConnState {
    Unauth,
    Auth,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<MobileGateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, gateway, addr))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<MobileGateway>, addr: SocketAddr) {
    if !gateway.is_ip_allowed(addr.ip()) {
        tracing::warn!(%addr, "rejecting mobile connection: ip not allowed");
        return;
    }

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut state = ConnState::Unauth;
    let mut device_id: Option<String> = None;
    let mut last_pong = Instant::now();
    let mut heartbeat = tokio::time::interval(gateway.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            let _ = tx.send(ServerMessage::error("Frame too large")).await;
                            continue;
                        }
                        let identifier = device_id.clone().unwrap_or_else(|| addr.ip().to_string());
                        if let Err(retry_after) = gateway.check_rate_limit(&identifier) {
                            gateway.audit().log(&crate::security::AuditEvent {
                                event_type: "rate_limited",
                                device_id: device_id.as_deref(),
                                ip_address: Some(&addr.ip().to_string()),
                                success: false,
                                details: serde_json::Map::new(),
                            });
                            let _ = tx.send(ServerMessage::error(format!(
                                "Rate limited, retry after {retry_after}s"
                            ))).await;
                            continue;
                        }
                        handle_frame(&gateway, &text, &mut state, &mut device_id, &tx, &addr).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > gateway.heartbeat_interval * 2 {
                    tracing::info!(device_id = ?device_id, "mobile connection missed pong deadline");
                    break;
                }
                let _ = tx.send(ServerMessage::Pong).await;
            }
        }
    }

    drop(tx);
    let _ = sender_handle.await;

    if let Some(id) = device_id {
        gateway.unregister(&id);
    }
}

async fn handle_frame(
    gateway: &Arc<MobileGateway>,
    text: &str,
    state: &mut ConnState,
    device_id: &mut Option<String>,
    tx: &mpsc::Sender<ServerMessage>,
    addr: &SocketAddr,
) {
    let remote = addr.ip().to_string();
    let audit = |event_type: &'static str, id: Option<&str>, success: bool| {
        gateway.audit().log(&crate::security::AuditEvent {
            event_type,
            device_id: id,
            ip_address: Some(&remote),
            success,
            details: serde_json::Map::new(),
        });
    };

    let parsed = match ClientMessage::decode(text) {
        Ok(m) => m,
        Err(_) => {
            audit("invalid_json", device_id.as_deref(), false);
            let _ = tx.send(ServerMessage::error("Invalid message")).await;
            return;
        }
    };

    match (*state, parsed) {
        (ConnState::Unauth, ClientMessage::Pair { session_id, temp_token, device_info }) => {
            if let Err(e) = gateway
                .validator()
                .validate_device_info(&device_info.device_name, &device_info.platform)
            {
                tracing::warn!(error = %e, "rejected pair: invalid device_info");
                audit("pair_invalid", None, false);
                let _ = tx.send(ServerMessage::error("Invalid pairing credentials")).await;
                return;
            }

            match gateway.pairing().validate_pairing(&session_id, &temp_token, device_info) {
                Ok(info) => {
                    let new_device_id = format!("device_{}", &session_id[..session_id.len().min(8)]);
                    let token = match gateway.credentials().issue(
                        &new_device_id,
                        &info.device_name,
                        Default::default(),
                    ) {
                        Ok(t) => t,
                        Err(_) => {
                            let _ = tx.send(ServerMessage::error("Internal error")).await;
                            return;
                        }
                    };
                    gateway.register(&new_device_id, &info.device_name, tx.clone());
                    *device_id = Some(new_device_id.clone());
                    *state = ConnState::Auth;
                    audit("pair_success", Some(&new_device_id), true);
                    let _ = tx
                        .send(ServerMessage::AuthSuccess {
                            jwt_token: Some(token),
                            device_id: new_device_id,
                            device_name: info.device_name,
                            message: None,
                        })
                        .await;
                }
                Err(_) => {
                    audit("pair_invalid", None, false);
                    let _ = tx.send(ServerMessage::error("Invalid pairing credentials")).await;
                }
            }
        }
        (ConnState::Unauth, ClientMessage::Auth { jwt_token }) => {
            match gateway.credentials().extract_device_credentials(&jwt_token) {
                Ok(creds) => {
                    gateway.register(&creds.device_id, &creds.device_name, tx.clone());
                    *device_id = Some(creds.device_id.clone());
                    *state = ConnState::Auth;
                    audit("auth_success", Some(&creds.device_id), true);
                    let _ = tx
                        .send(ServerMessage::AuthSuccess {
                            jwt_token: None,
                            device_id: creds.device_id,
                            device_name: creds.device_name,
                            message: None,
                        })
                        .await;
                }
                Err(_) => {
                    audit("auth_invalid", None, false);
                    let _ = tx.send(ServerMessage::error("Invalid credentials")).await;
                }
            }
        }
        (ConnState::Unauth, _) => {
            audit("not_authenticated", None, false);
            let _ = tx.send(ServerMessage::error("Not authenticated")).await;
        }
        (ConnState::Auth, ClientMessage::Message { content }) => {
            let id = device_id.clone().expect("AUTH state always has a device_id");
            if let Err(e) = gateway.validator().validate_message_content(&content) {
                tracing::warn!(error = %e, device_id = %id, "rejected message content");
                audit("bad_message_content", Some(&id), false);
                let _ = tx.send(ServerMessage::error("Message content contains suspicious patterns")).await;
                return;
            }
            let _ = tx.send(ServerMessage::Ack { message: "received".to_string() }).await;
            let sender = gateway.device_name(&id).unwrap_or_else(|| id.clone());
            gateway.forward_message(&id, &sender, &id, &content).await;
        }
        (ConnState::Auth, ClientMessage::Ping) => {
            let _ = tx.send(ServerMessage::Pong).await;
        }
        (ConnState::Auth, _) => {
            audit("unknown_message_type", device_id.as_deref(), false);
            let _ = tx.send(ServerMessage::error("Unknown message type")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialManager;
    use crate::pairing::PairingManager;
    use crate::security::{AuditLogger, IpAllowlist, RateLimiter};
    use axum::routing::get;
    use axum::Router;
    use futures_util::{SinkExt as _, StreamExt as _};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite;

    struct NullSink;

    #[async_trait::async_trait]
    impl crate::gateway::DownstreamSink for NullSink {
        async fn forward(&self, _device_id: &str, _sender: &str, _chat_id: &str, _content: &str) {}
    }

    async fn spawn_gateway() -> (String, Arc<MobileGateway>, tokio::task::JoinHandle<()>) {
        let credentials = Arc::new(CredentialManager::new(
            "0123456789abcdef0123456789abcdef",
            "HS256",
            24,
        ));
        let pairing = Arc::new(PairingManager::new("ws://localhost:8787", 5));
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::open(dir.path().join("audit.log"), 100, 10).unwrap());
        let gateway = Arc::new(MobileGateway::new(
            credentials,
            pairing,
            RateLimiter::new(1000, 300),
            IpAllowlist::new(false, &[]),
            audit,
            Duration::from_secs(30),
        ));
        gateway.set_sink(Arc::new(NullSink));

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(gateway.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        (format!("ws://127.0.0.1:{}/", addr.port()), gateway, handle)
    }

    #[tokio::test]
    async fn unauthenticated_message_is_rejected() {
        let (url, _gw, server) = spawn_gateway().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(tungstenite::Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let text = reply.into_text().unwrap();
        assert!(text.contains("Not authenticated"));

        let _ = ws.close(None).await;
        server.abort();
    }

    #[tokio::test]
    async fn pair_then_auth_round_trip() {
        let (url, gw, server) = spawn_gateway().await;
        let (session_id, _png) = gw.pairing().create_session();
        let session = gw.pairing().get_session(&session_id).unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let pair_msg = serde_json::json!({
            "type": "pair",
            "session_id": session_id,
            "temp_token": session.temp_token,
            "device_info": {"device_name": "Test Device", "platform": "ios"},
        });
        ws.send(tungstenite::Message::Text(pair_msg.to_string())).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["type"], "auth_success");
        assert!(parsed["jwt_token"].is_string());
        let jwt = parsed["jwt_token"].as_str().unwrap().to_string();

        let _ = ws.close(None).await;

        // Reconnect with the issued token instead of pairing again.
        let (mut ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let auth_msg = serde_json::json!({"type": "auth", "jwt_token": jwt});
        ws2.send(tungstenite::Message::Text(auth_msg.to_string())).await.unwrap();
        let reply2 = ws2.next().await.unwrap().unwrap().into_text().unwrap();
        let parsed2: serde_json::Value = serde_json::from_str(&reply2).unwrap();
        assert_eq!(parsed2["type"], "auth_success");
        assert_eq!(parsed2["device_id"], parsed["device_id"]);

        let _ = ws2.close(None).await;
        server.abort();
    }

    #[tokio::test]
    async fn replaying_pair_fails() {
        let (url, gw, server) = spawn_gateway().await;
        let (session_id, _png) = gw.pairing().create_session();
        let session = gw.pairing().get_session(&session_id).unwrap();
        let pair_msg = serde_json::json!({
            "type": "pair",
            "session_id": session_id,
            "temp_token": session.temp_token,
            "device_info": {"device_name": "Test Device", "platform": "ios"},
        });

        let (mut ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws1.send(tungstenite::Message::Text(pair_msg.to_string())).await.unwrap();
        let _ = ws1.next().await.unwrap().unwrap();
        let _ = ws1.close(None).await;

        let (mut ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws2.send(tungstenite::Message::Text(pair_msg.to_string())).await.unwrap();
        let reply = ws2.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(reply.contains("Invalid pairing credentials"));

        let _ = ws2.close(None).await;
        server.abort();
    }

    #[tokio::test]
    async fn xss_message_content_is_rejected() {
        let (url, gw, server) = spawn_gateway().await;
        let (session_id, _png) = gw.pairing().create_session();
        let session = gw.pairing().get_session(&session_id).unwrap();
        let pair_msg = serde_json::json!({
            "type": "pair",
            "session_id": session_id,
            "temp_token": session.temp_token,
            "device_info": {"device_name": "Test Device", "platform": "ios"},
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(tungstenite::Message::Text(pair_msg.to_string())).await.unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        let bad = serde_json::json!({"type": "message", "content": "<script>alert(1)</script>"});
        ws.send(tungstenite::Message::Text(bad.to_string())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(reply.contains("suspicious patterns"));

        let _ = ws.close(None).await;
        server.abort();
    }
}
