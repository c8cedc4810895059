//! Mobile WebSocket wire protocol: one JSON object per frame, tagged on
//! `type`. Decoding an unknown `type` is a caller-visible error, never a
//! silent no-op — see `ClientMessage::decode`.

use serde::{Deserialize, Serialize};

use crate::pairing::DeviceInfo;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pair {
        session_id: String,
        temp_token: String,
        device_info: DeviceInfo,
    },
    Auth {
        jwt_token: String,
    },
    Message {
        content: String,
    },
    Ping,
}

impl ClientMessage {
    /// Parse a raw text frame. Distinguishes "not JSON" from "JSON but
    /// unrecognized shape" only for logging purposes — both are reported
    /// to the client identically.
    pub fn decode(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(skip_serializing_if = "Option::is_none")]
        jwt_token: Option<String>,
        device_id: String,
        device_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Ack {
        message: String,
    },
    Message {
        content: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}
