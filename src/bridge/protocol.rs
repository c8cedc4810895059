//! Bridge WebSocket wire protocol, used on both ends of the relay's
//! `/bridge` route.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToRelay {
    BridgeAuth { bridge_token: String },
    BridgeResponse { device_id: String, content: String },
    BridgePong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToClient {
    BridgeAuthSuccess,
    BridgeMessage {
        device_id: String,
        sender: String,
        chat_id: String,
        content: String,
    },
    BridgePing,
    Error {
        message: String,
    },
}

impl RelayToClient {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("RelayToClient always serializes")
    }
}

/// Close code sent when a second bridge attempts to connect while one is
/// already authenticated.
pub const CLOSE_ALREADY_CONNECTED: u16 = 4000;
/// Close code sent when `bridge_auth` fails token verification.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

pub const KEEPALIVE_INTERVAL_SECS: u64 = 25;
