//! Relay process wiring: assembles the Mobile Gateway, Bridge Tunnel, and
//! the thin REST pairing surface into one axum server.
//!
//! Bind → build router → spawn with a graceful-shutdown signal → return a
//! handle. Serves plain TCP unless `mobile.tls_enabled` is set, in which
//! case the same listener is handed to `axum-server`'s rustls binder
//! instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::tunnel::BridgeTunnel;
use crate::config::RelayConfig;
use crate::credentials::CredentialManager;
use crate::error::{ApiError, RelayError};
use crate::gateway::{self, GatewayError, MobileGateway};
use crate::pairing::PairingManager;
use crate::security::{AuditLogger, IpAllowlist, RateLimiter};

const RATE_LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

enum Shutdown {
    Plain(Option<oneshot::Sender<()>>),
    Tls(axum_server::Handle),
}

pub struct RelayHandle {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl RelayHandle {
    pub fn shutdown(&mut self) {
        match &mut self.shutdown {
            Shutdown::Plain(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                    tracing::info!("relay shutdown signal sent");
                }
            }
            Shutdown::Tls(handle) => {
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
                tracing::info!("relay shutdown signal sent (tls)");
            }
        }
    }
}

pub async fn start_relay(config: RelayConfig) -> Result<RelayHandle, RelayError> {
    let websocket_url = if !config.relay.public_url.is_empty() {
        config.relay.public_url.clone()
    } else {
        format!("ws://localhost:{}", config.mobile.websocket_port)
    };

    let credentials = Arc::new(CredentialManager::new(
        &config.auth.jwt_secret,
        &config.auth.jwt_algorithm,
        config.auth.jwt_expiry_hours,
    ));
    let pairing = Arc::new(PairingManager::new(
        websocket_url,
        config.auth.pairing_session_expiry_minutes,
    ));
    let audit = Arc::new(AuditLogger::open(
        config.enterprise.audit_log_path.clone(),
        config.enterprise.audit_log_max_file_size_mb,
        config.enterprise.audit_log_max_files,
    )?);
    let rate_limiter = RateLimiter::new(
        config.enterprise.rate_limit_requests_per_minute,
        config.enterprise.rate_limit_block_duration_secs,
    );
    let ip_allowlist = IpAllowlist::new(config.enterprise.ip_whitelist_enabled, &config.enterprise.ip_whitelist);

    let gateway = Arc::new(MobileGateway::new(
        credentials,
        pairing.clone(),
        rate_limiter,
        ip_allowlist,
        audit,
        Duration::from_secs(config.mobile.heartbeat_interval_secs),
    ));

    let tunnel = BridgeTunnel::new(config.relay.bridge_token.clone(), gateway.clone());
    gateway.set_sink(tunnel.clone());

    pairing.spawn_sweeper();

    let sweeper_gateway = gateway.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMITER_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper_gateway.sweep_rate_limiter();
        }
    });

    let mobile_routes = Router::new()
        .route("/", get(gateway::handler::ws_upgrade))
        .with_state(gateway.clone());

    let bridge_routes = Router::new()
        .route("/bridge", get(crate::bridge::tunnel::ws_upgrade))
        .with_state(tunnel);

    let pair_routes = Router::new()
        .route("/api/pair/session", post(create_pair_session))
        .route("/api/pair/session/{id}/qr", get(get_pair_session_qr))
        .with_state(pairing);

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .merge(mobile_routes)
        .merge(bridge_routes)
        .merge(pair_routes)
        .layer(cors)
        .into_make_service_with_connect_info::<SocketAddr>();

    let std_listener = std::net::TcpListener::bind(("0.0.0.0", config.mobile.websocket_port))
        .map_err(RelayError::Io)?;
    std_listener.set_nonblocking(true).map_err(RelayError::Io)?;
    let addr = std_listener.local_addr().map_err(RelayError::Io)?;

    let shutdown = if config.mobile.tls_enabled {
        let cert_path = config.mobile.tls_cert_path.clone().ok_or_else(|| {
            RelayError::Gateway(GatewayError::Tls("tls_cert_path not set".to_string()))
        })?;
        let key_path = config.mobile.tls_key_path.clone().ok_or_else(|| {
            RelayError::Gateway(GatewayError::Tls("tls_key_path not set".to_string()))
        })?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .map_err(|e| RelayError::Gateway(GatewayError::Tls(e.to_string())))?;

        let handle = axum_server::Handle::new();
        let server_handle = handle.clone();
        tokio::spawn(async move {
            tracing::info!(%addr, "relay listening (tls)");
            if let Err(e) = axum_server::from_tcp_rustls(std_listener, tls_config)
                .handle(server_handle)
                .serve(app)
                .await
            {
                tracing::error!(error = %e, "relay server error");
            }
            tracing::info!("relay stopped");
        });

        Shutdown::Tls(handle)
    } else {
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(RelayError::Io)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tracing::info!(%addr, "relay listening");
            let shutdown_signal = async move {
                let _ = shutdown_rx.await;
                tracing::info!("relay received shutdown signal");
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
                tracing::error!(error = %e, "relay server error");
            }
            tracing::info!("relay stopped");
        });

        Shutdown::Plain(Some(shutdown_tx))
    };

    Ok(RelayHandle { addr, shutdown })
}

#[derive(Debug, Serialize)]
struct PairSessionResponse {
    session_id: String,
}

async fn create_pair_session(
    State(pairing): State<Arc<PairingManager>>,
) -> Result<Json<PairSessionResponse>, ApiError> {
    let (session_id, _png) = pairing.create_session();
    Ok(Json(PairSessionResponse { session_id }))
}

async fn get_pair_session_qr(
    State(pairing): State<Arc<PairingManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let png = pairing.qr_png_for_session(&id).ok_or(ApiError::NotFound)?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/png")], png))
}

/// Orderly shutdown entry point: waits for SIGINT/SIGTERM, then signals the
/// relay to stop accepting new work and close existing connections.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.mobile.websocket_port = 0;
        cfg.auth.jwt_secret = "0123456789abcdef0123456789abcdef".to_string();
        cfg.relay.bridge_token = "test-bridge-token".to_string();
        cfg.enterprise.audit_log_path = std::env::temp_dir().join(format!(
            "relay-test-audit-{}.log",
            uuid::Uuid::new_v4()
        ));
        cfg
    }

    #[tokio::test]
    async fn relay_starts_and_shuts_down_cleanly() {
        let mut handle = start_relay(test_config()).await.unwrap();
        assert!(handle.addr.port() > 0);
        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn create_pair_session_returns_an_id() {
        let handle = start_relay(test_config()).await.unwrap();
        let url = format!("http://{}/api/pair/session", handle.addr);
        let resp = reqwest::Client::new().post(&url).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(!body["session_id"].as_str().unwrap().is_empty());
    }

    /// Build a gateway wired to a real `BridgeTunnel`, served alongside the
    /// bridge route on one router, the same composition `start_relay` does.
    async fn spawn_gateway_and_tunnel() -> (
        String,
        String,
        Arc<MobileGateway>,
        Arc<BridgeTunnel>,
        tokio::task::JoinHandle<()>,
    ) {
        let credentials = Arc::new(CredentialManager::new(
            "0123456789abcdef0123456789abcdef",
            "HS256",
            24,
        ));
        let pairing = Arc::new(PairingManager::new("ws://localhost:8787", 5));
        let dir = std::env::temp_dir().join(format!("relay-test-audit-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let audit = Arc::new(AuditLogger::open(dir.join("audit.log"), 100, 10).unwrap());
        let gateway = Arc::new(MobileGateway::new(
            credentials,
            pairing.clone(),
            RateLimiter::new(1000, 300),
            IpAllowlist::new(false, &[]),
            audit,
            Duration::from_secs(30),
        ));
        let tunnel = BridgeTunnel::new("test-bridge-token".to_string(), gateway.clone());
        gateway.set_sink(tunnel.clone());

        let mobile_routes = Router::new()
            .route("/", axum::routing::get(gateway::handler::ws_upgrade))
            .with_state(gateway.clone());
        let bridge_routes = Router::new()
            .route("/bridge", axum::routing::get(crate::bridge::tunnel::ws_upgrade))
            .with_state(tunnel.clone());
        let app = mobile_routes
            .merge(bridge_routes)
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            format!("ws://127.0.0.1:{}/", addr.port()),
            format!("ws://127.0.0.1:{}/bridge", addr.port()),
            gateway,
            tunnel,
            handle,
        )
    }

    /// Pair a fresh device against `mobile_url` and return its WebSocket
    /// connection plus its issued `device_id`.
    async fn pair_one_device(
        mobile_url: &str,
        pairing: &PairingManager,
    ) -> (
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        String,
    ) {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite;

        let (session_id, _png) = pairing.create_session();
        let session = pairing.get_session(&session_id).unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(mobile_url).await.unwrap();
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
        let device_id = parsed["device_id"].as_str().unwrap().to_string();

        (ws, device_id)
    }

    #[tokio::test]
    async fn offline_bridge_sends_notice_after_ack() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite;

        let (mobile_url, _bridge_url, gateway, _tunnel, server) = spawn_gateway_and_tunnel().await;
        let (mut ws, _device_id) = pair_one_device(&mobile_url, gateway.pairing()).await;

        let msg = serde_json::json!({"type": "message", "content": "hi"});
        ws.send(tungstenite::Message::Text(msg.to_string())).await.unwrap();

        let ack = ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&ack).unwrap()["type"], "ack");

        let notice = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&notice).unwrap();
        assert_eq!(parsed["type"], "message");
        assert!(parsed["content"].as_str().unwrap().to_lowercase().contains("offline"));

        let _ = ws.close(None).await;
        server.abort();
    }

    #[tokio::test]
    async fn bridge_round_trip_ping_pong() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite;

        let (mobile_url, bridge_url, gateway, _tunnel, server) = spawn_gateway_and_tunnel().await;

        let (mut bridge_ws, _) = tokio_tungstenite::connect_async(&bridge_url).await.unwrap();
        let auth = serde_json::json!({"type": "bridge_auth", "bridge_token": "test-bridge-token"});
        bridge_ws.send(tungstenite::Message::Text(auth.to_string())).await.unwrap();
        let auth_reply = bridge_ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(auth_reply.contains("bridge_auth_success"));

        let (mut mobile_ws, device_id) = pair_one_device(&mobile_url, gateway.pairing()).await;

        let ping = serde_json::json!({"type": "message", "content": "ping?"});
        mobile_ws.send(tungstenite::Message::Text(ping.to_string())).await.unwrap();

        let ack = mobile_ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&ack).unwrap()["type"], "ack");

        let bridge_msg = bridge_ws.next().await.unwrap().unwrap().into_text().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&bridge_msg).unwrap();
        assert_eq!(parsed["type"], "bridge_message");
        assert_eq!(parsed["device_id"], device_id);
        assert_eq!(parsed["content"], "ping?");

        let response = serde_json::json!({
            "type": "bridge_response",
            "device_id": device_id,
            "content": "pong!",
        });
        bridge_ws.send(tungstenite::Message::Text(response.to_string())).await.unwrap();

        let delivered = mobile_ws.next().await.unwrap().unwrap().into_text().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&delivered).unwrap();
        assert_eq!(parsed["type"], "message");
        assert_eq!(parsed["content"], "pong!");

        let _ = mobile_ws.close(None).await;
        let _ = bridge_ws.close(None).await;
        server.abort();
    }
}
