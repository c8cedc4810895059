//! Top-level error aggregation for the relay and bridge-client binaries.
//!
//! Each subsystem (credentials, pairing, security, gateway, bridge) owns its
//! own `thiserror` enum; this module only aggregates them at the points where
//! a binary entry point needs a single error type to bubble up to `main`.

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::credentials::CredentialError;
use crate::gateway::GatewayError;
use crate::pairing::PairingError;
use crate::security::SecurityError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup error: {0}")]
    Startup(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error surfaced by the REST pairing endpoints. Implements `IntoResponse`
/// so handlers can return it directly.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        match err {
            PairingError::SessionNotFound | PairingError::SessionExpired => ApiError::NotFound,
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;
        use serde_json::json;

        let (status, code, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "bad_request", self.to_string())
            }
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({"error": {"code": code, "message": message}})),
        )
            .into_response()
    }
}
