//! Pairing Manager: one-shot QR-based device pairing sessions.
//!
//! A session carries enough entropy for a mobile client to prove it scanned
//! the real QR code (`temp_token`) without yet holding a signed credential.
//! Sessions are single-use: `validate_pairing` removes the session before
//! returning success, so replay is structurally impossible.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const SESSION_ID_BYTES: usize = 16; // 128 bits
const TEMP_TOKEN_BYTES: usize = 32; // 256 bits
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("no pairing session found")]
    SessionNotFound,
    #[error("pairing session has expired")]
    SessionExpired,
    #[error("pairing token does not match")]
    TokenMismatch,
    #[error("device_info failed validation: {0}")]
    InvalidDeviceInfo(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub platform: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PairingSession {
    pub session_id: String,
    pub temp_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub device_info: Option<DeviceInfo>,
    pub websocket_url: String,
}

impl PairingSession {
    fn is_expired(&self) -> bool {
        chrono::Utc::now() > self.expires_at
    }
}

/// The structured payload encoded into the QR code / ASCII render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrPayload {
    pub session_id: String,
    pub websocket_url: String,
    pub temp_token: String,
    pub timestamp: i64,
}

pub struct PairingManager {
    websocket_url: String,
    session_expiry_minutes: i64,
    sessions: Mutex<HashMap<String, PairingSession>>,
    shutdown: Notify,
}

impl PairingManager {
    pub fn new(websocket_url: impl Into<String>, session_expiry_minutes: i64) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            session_expiry_minutes,
            sessions: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Spawn the background sweeper that deletes expired sessions once a
    /// minute. Sweeping is a latency optimization only — `validate_pairing`
    /// always re-checks expiry itself.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        manager.sweep_expired();
                    }
                    _ = manager.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn stop_sweeper(&self) {
        self.shutdown.notify_one();
    }

    fn sweep_expired(&self) {
        let mut sessions = self.sessions.lock().expect("pairing sessions lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "pairing sweeper removed expired sessions");
        }
    }

    /// Create a new pairing session, returning its id and the PNG-encoded
    /// QR image bytes.
    pub fn create_session(&self) -> (String, Vec<u8>) {
        let session_id = random_url_safe(SESSION_ID_BYTES);
        let temp_token = random_url_safe(TEMP_TOKEN_BYTES);
        let expires_at =
            chrono::Utc::now() + chrono::Duration::minutes(self.session_expiry_minutes);

        let session = PairingSession {
            session_id: session_id.clone(),
            temp_token: temp_token.clone(),
            expires_at,
            device_info: None,
            websocket_url: self.websocket_url.clone(),
        };

        let payload = QrPayload {
            session_id: session_id.clone(),
            websocket_url: self.websocket_url.clone(),
            temp_token: temp_token.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };

        self.sessions
            .lock()
            .expect("pairing sessions lock poisoned")
            .insert(session_id.clone(), session);

        let png = render_qr_png(&payload);
        tracing::info!(session_id = %session_id, "created pairing session");
        (session_id, png)
    }

    /// Validate and consume a pairing session. On success the session is
    /// removed (one-shot) and `device_info` is captured for the caller.
    pub fn validate_pairing(
        &self,
        session_id: &str,
        temp_token: &str,
        device_info: DeviceInfo,
    ) -> Result<DeviceInfo, PairingError> {
        let mut sessions = self.sessions.lock().expect("pairing sessions lock poisoned");

        let session = sessions.get(session_id).ok_or(PairingError::SessionNotFound)?;

        if session.is_expired() {
            sessions.remove(session_id);
            return Err(PairingError::SessionExpired);
        }

        if session.temp_token != temp_token {
            return Err(PairingError::TokenMismatch);
        }

        sessions.remove(session_id);
        tracing::info!(session_id = %session_id, "pairing session validated and consumed");
        Ok(device_info)
    }

    pub fn get_session(&self, session_id: &str) -> Option<PairingSession> {
        self.sessions
            .lock()
            .expect("pairing sessions lock poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().expect("pairing sessions lock poisoned").len()
    }

    /// Re-render the PNG QR code for an existing session, for the REST
    /// `GET /api/pair/session/{id}/qr` surface.
    pub fn qr_png_for_session(&self, session_id: &str) -> Option<Vec<u8>> {
        let session = self.get_session(session_id)?;
        let payload = QrPayload {
            session_id: session.session_id.clone(),
            websocket_url: session.websocket_url.clone(),
            temp_token: session.temp_token.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        Some(render_qr_png(&payload))
    }

    /// Render a terminal-friendly ASCII QR code carrying the same payload
    /// as `create_session`'s PNG, for a session that already exists.
    pub fn generate_qr_ascii(&self, session_id: &str, temp_token: &str) -> String {
        let payload = QrPayload {
            session_id: session_id.to_string(),
            websocket_url: self.websocket_url.clone(),
            temp_token: temp_token.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        render_qr_ascii(&payload)
    }
}

fn random_url_safe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn qr_code_for(payload: &QrPayload) -> qrcode::QrCode {
    let data = serde_json::to_vec(payload).expect("QrPayload always serializes");
    qrcode::QrCode::with_error_correction_level(&data, qrcode::EcLevel::L)
        .expect("QR payload always fits within QR capacity")
}

/// PNG render at error-correction level L, box size 10, border 4 — per §6.
fn render_qr_png(payload: &QrPayload) -> Vec<u8> {
    const BOX_SIZE: u32 = 10;
    const BORDER: u32 = 4;

    let code = qr_code_for(payload);
    let width = code.width() as u32;
    let colors = code.to_colors();
    let image_side = (width + 2 * BORDER) * BOX_SIZE;

    let mut image = image::GrayImage::from_pixel(image_side, image_side, image::Luma([255u8]));

    for y in 0..width {
        for x in 0..width {
            if colors[(y * width + x) as usize] == qrcode::Color::Dark {
                let px0 = (x + BORDER) * BOX_SIZE;
                let py0 = (y + BORDER) * BOX_SIZE;
                for dy in 0..BOX_SIZE {
                    for dx in 0..BOX_SIZE {
                        image.put_pixel(px0 + dx, py0 + dy, image::Luma([0u8]));
                    }
                }
            }
        }
    }

    let mut buf = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .expect("encoding a grayscale QR image to PNG never fails");
    buf
}

/// ASCII render at box size 1, border 2, filled cells as `██` — per §6.
fn render_qr_ascii(payload: &QrPayload) -> String {
    const BORDER: usize = 2;

    let code = qr_code_for(payload);
    let width = code.width();
    let colors = code.to_colors();
    let total = width + 2 * BORDER;

    let mut out = String::new();
    for row in 0..total {
        for col in 0..total {
            let dark = if row < BORDER
                || row >= BORDER + width
                || col < BORDER
                || col >= BORDER + width
            {
                false
            } else {
                colors[(row - BORDER) * width + (col - BORDER)] == qrcode::Color::Dark
            };
            out.push_str(if dark { "██" } else { "  " });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PairingManager {
        PairingManager::new("ws://localhost:8787", 5)
    }

    fn device_info() -> DeviceInfo {
        DeviceInfo {
            device_name: "Test Device".to_string(),
            platform: "ios".to_string(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn create_session_produces_nonempty_png() {
        let mgr = manager();
        let (session_id, png) = mgr.create_session();
        assert!(!session_id.is_empty());
        assert!(!png.is_empty());
        assert_eq!(mgr.active_session_count(), 1);
    }

    #[test]
    fn validate_pairing_succeeds_with_matching_token() {
        let mgr = manager();
        let (session_id, _) = mgr.create_session();
        let session = mgr.get_session(&session_id).unwrap();

        let result = mgr.validate_pairing(&session_id, &session.temp_token, device_info());
        assert!(result.is_ok());
    }

    #[test]
    fn validate_pairing_is_one_shot() {
        // A second validation of the same (session_id, temp_token) must fail.
        let mgr = manager();
        let (session_id, _) = mgr.create_session();
        let session = mgr.get_session(&session_id).unwrap();
        let temp_token = session.temp_token.clone();

        assert!(mgr
            .validate_pairing(&session_id, &temp_token, device_info())
            .is_ok());
        assert!(mgr
            .validate_pairing(&session_id, &temp_token, device_info())
            .is_err());
    }

    #[test]
    fn validate_pairing_rejects_wrong_token() {
        let mgr = manager();
        let (session_id, _) = mgr.create_session();
        assert!(matches!(
            mgr.validate_pairing(&session_id, "wrong-token", device_info()),
            Err(PairingError::TokenMismatch)
        ));
    }

    #[test]
    fn validate_pairing_rejects_unknown_session() {
        let mgr = manager();
        assert!(matches!(
            mgr.validate_pairing("no-such-session", "token", device_info()),
            Err(PairingError::SessionNotFound)
        ));
    }

    #[test]
    fn validate_pairing_rejects_expired_session() {
        let mgr = PairingManager::new("ws://localhost:8787", 0);
        let (session_id, _) = mgr.create_session();
        let session = mgr.get_session(&session_id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(
            mgr.validate_pairing(&session_id, &session.temp_token, device_info()),
            Err(PairingError::SessionExpired)
        ));
    }

    #[test]
    fn ascii_qr_uses_expected_fill_characters() {
        let mgr = manager();
        let ascii = mgr.generate_qr_ascii("abc", "def");
        assert!(ascii.contains("██") || ascii.contains("  "));
    }
}
