//! Mobile Gateway: the public-facing WebSocket surface mobile clients pair
//! and authenticate against, per connection state machine UNAUTH → AUTH.
//!
//! Split socket, mpsc outbound channel, a sender task draining it, and a
//! `tokio::select!` loop handling incoming frames alongside a heartbeat tick.

pub mod handler;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::CredentialManager;
use crate::pairing::PairingManager;
use crate::security::{AuditLogger, InputValidator, IpAllowlist, RateLimiter};

use protocol::ServerMessage;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Tls(String),
}

/// Forwards a mobile `message` event downstream (to the Bridge Tunnel in
/// practice). Implementations decide what "not connected" means for their
/// side; the gateway only needs to know whether to show an inline ack.
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    async fn forward(&self, device_id: &str, sender: &str, chat_id: &str, content: &str);
}

struct ConnectedClient {
    device_name: String,
    outbound: mpsc::Sender<ServerMessage>,
}

pub struct MobileGateway {
    credentials: Arc<CredentialManager>,
    pairing: Arc<PairingManager>,
    validator: InputValidator,
    rate_limiter: Mutex<RateLimiter>,
    ip_allowlist: IpAllowlist,
    audit: Arc<AuditLogger>,
    clients: Mutex<HashMap<String, ConnectedClient>>,
    sink: OnceCell<Arc<dyn DownstreamSink>>,
    pub heartbeat_interval: Duration,
}

impl MobileGateway {
    pub fn new(
        credentials: Arc<CredentialManager>,
        pairing: Arc<PairingManager>,
        rate_limiter: RateLimiter,
        ip_allowlist: IpAllowlist,
        audit: Arc<AuditLogger>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            credentials,
            pairing,
            validator: InputValidator::new(),
            rate_limiter: Mutex::new(rate_limiter),
            ip_allowlist,
            audit,
            clients: Mutex::new(HashMap::new()),
            sink: OnceCell::new(),
            heartbeat_interval,
        }
    }

    /// Wire in the downstream sink after construction — the sink (the
    /// Bridge Tunnel) typically needs a reference back to this gateway, so
    /// the two can't be built in one step.
    pub fn set_sink(&self, sink: Arc<dyn DownstreamSink>) {
        let _ = self.sink.set(sink);
    }

    pub fn is_ip_allowed(&self, addr: std::net::IpAddr) -> bool {
        self.ip_allowlist.is_allowed(addr)
    }

    pub fn check_rate_limit(&self, identifier: &str) -> Result<(), u64> {
        self.rate_limiter
            .lock()
            .expect("rate limiter lock poisoned")
            .check(identifier)
    }

    pub fn sweep_rate_limiter(&self) {
        self.rate_limiter.lock().expect("rate limiter lock poisoned").sweep();
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.pairing
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Register a newly authenticated connection, evicting any prior
    /// connection for the same `device_id`.
    fn register(&self, device_id: &str, device_name: &str, outbound: mpsc::Sender<ServerMessage>) {
        let mut clients = self.clients.lock().expect("client table lock poisoned");
        clients.insert(
            device_id.to_string(),
            ConnectedClient { device_name: device_name.to_string(), outbound },
        );
    }

    fn unregister(&self, device_id: &str) {
        self.clients.lock().expect("client table lock poisoned").remove(device_id);
    }

    /// Look up a connected client's human-readable `device_name`.
    pub fn device_name(&self, device_id: &str) -> Option<String> {
        self.clients
            .lock()
            .expect("client table lock poisoned")
            .get(device_id)
            .map(|c| c.device_name.clone())
    }

    /// Send `content` to `device_id`, wrapped as a `message` frame. Returns
    /// `false` without performing any write if the device isn't connected.
    pub fn send_to_device(&self, device_id: &str, content: &str) -> bool {
        let outbound = {
            let clients = self.clients.lock().expect("client table lock poisoned");
            clients.get(device_id).map(|c| c.outbound.clone())
        };
        match outbound {
            Some(tx) => tx.try_send(ServerMessage::Message { content: content.to_string() }).is_ok(),
            None => false,
        }
    }

    /// Send `content` to every connected device except `exclude` (if any).
    pub fn broadcast(&self, content: &str, exclude: Option<&str>) {
        let clients = self.clients.lock().expect("client table lock poisoned");
        for (device_id, client) in clients.iter() {
            if Some(device_id.as_str()) == exclude {
                continue;
            }
            let _ = client.outbound.try_send(ServerMessage::Message { content: content.to_string() });
        }
    }

    pub fn get_connected_devices(&self) -> Vec<String> {
        self.clients.lock().expect("client table lock poisoned").keys().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.clients.lock().expect("client table lock poisoned").len()
    }

    async fn forward_message(&self, device_id: &str, sender: &str, chat_id: &str, content: &str) {
        match self.sink.get() {
            Some(sink) => sink.forward(device_id, sender, chat_id, content).await,
            None => {
                tracing::warn!("no downstream sink configured; dropping mobile message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{IpAllowlist as Allowlist, RateLimiter as Limiter};
    use std::path::PathBuf;

    fn gateway() -> MobileGateway {
        let credentials = Arc::new(CredentialManager::new(
            "0123456789abcdef0123456789abcdef",
            "HS256",
            24,
        ));
        let pairing = Arc::new(PairingManager::new("ws://localhost:8787", 5));
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(
            AuditLogger::open(dir.path().join("audit.log") as PathBuf, 100, 10).unwrap(),
        );
        MobileGateway::new(
            credentials,
            pairing,
            Limiter::new(60, 300),
            Allowlist::new(false, &[]),
            audit,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn send_to_device_returns_false_when_not_connected() {
        let gw = gateway();
        assert!(!gw.send_to_device("nobody", "hi"));
    }

    #[tokio::test]
    async fn register_then_send_to_device_succeeds() {
        let gw = gateway();
        let (tx, mut rx) = mpsc::channel(4);
        gw.register("device-1", "Phone", tx);
        assert!(gw.send_to_device("device-1", "hello"));
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Message { content } if content == "hello"));
    }

    #[test]
    fn unregister_removes_from_connected_devices() {
        let gw = gateway();
        let (tx, _rx) = mpsc::channel(4);
        gw.register("device-1", "Phone", tx);
        assert_eq!(gw.connected_count(), 1);
        gw.unregister("device-1");
        assert_eq!(gw.connected_count(), 0);
    }

    #[test]
    fn registering_same_device_id_evicts_prior_connection() {
        let gw = gateway();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        gw.register("device-1", "Phone", tx1);
        gw.register("device-1", "Phone", tx2);
        assert_eq!(gw.connected_count(), 1);
    }
}
