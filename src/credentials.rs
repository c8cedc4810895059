//! Credential Manager: mints, validates, and refreshes signed device
//! credentials (JWS tokens carrying `{device_id, device_name, iat, exp,
//! type:"access", ...}`).
//!
//! Mirrors the pairing manager's shape (a plain struct holding config,
//! `thiserror` error enum, exhaustive unit tests) but the actual signing
//! is delegated to `jsonwebtoken` rather than hand-rolled crypto.

use std::collections::BTreeMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_SECRET_BYTES: usize = 32;
const TOKEN_TYPE: &str = "access";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token is malformed or signature is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,

    #[error("token is not an access token")]
    WrongType,

    #[error("token is missing required claim: {0}")]
    MissingClaim(&'static str),
}

/// Claims carried by every issued token. `extra` holds caller-supplied
/// fields that survive a `refresh` (anything outside iat/exp/type/device_id/
/// device_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub device_id: String,
    pub device_name: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Device credentials extracted from a validated token, for display/logging.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub device_name: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl DeviceCredentials {
    fn from_claims(claims: &Claims) -> Self {
        Self {
            device_id: claims.device_id.clone(),
            device_name: claims.device_name.clone(),
            issued_at: claims.iat,
            expires_at: claims.exp,
        }
    }
}

pub struct CredentialManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    expiry_hours: i64,
}

impl CredentialManager {
    /// Build a manager from a configured secret. If the secret is empty or
    /// shorter than 32 bytes, a fresh high-entropy secret is generated in
    /// its place and a warning is emitted — this guarantees no weak-key
    /// deployment but invalidates tokens issued before a restart.
    pub fn new(secret: &str, algorithm: &str, expiry_hours: i64) -> Self {
        let effective_secret = if secret.len() < MIN_SECRET_BYTES {
            tracing::warn!(
                "configured jwt_secret is missing or shorter than {MIN_SECRET_BYTES} bytes — \
                 generating a temporary secret; tokens will not survive a restart"
            );
            generate_secret()
        } else {
            secret.to_string()
        };

        let algorithm = parse_algorithm(algorithm);

        Self {
            encoding_key: EncodingKey::from_secret(effective_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(effective_secret.as_bytes()),
            algorithm,
            expiry_hours,
        }
    }

    /// Mint a new access token for `device_id`/`device_name`, with any extra
    /// claims the caller wants to attach (carried through `refresh`).
    pub fn issue(
        &self,
        device_id: &str,
        device_name: &str,
        extra: BTreeMap<String, serde_json::Value>,
    ) -> Result<String, CredentialError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            iat: now,
            exp: now + self.expiry_hours * 3600,
            token_type: TOKEN_TYPE.to_string(),
            extra,
        };
        self.encode(&claims)
    }

    fn encode(&self, claims: &Claims) -> Result<String, CredentialError> {
        jsonwebtoken::encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|_| CredentialError::Invalid)
    }

    fn decode(&self, token: &str) -> Result<Claims, CredentialError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 0;
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid,
            })
    }

    /// Validate a token, returning its `device_id` on success.
    pub fn validate(&self, token: &str) -> Result<String, CredentialError> {
        let claims = self.decode(token)?;
        if claims.token_type != TOKEN_TYPE {
            return Err(CredentialError::WrongType);
        }
        Ok(claims.device_id)
    }

    /// Signature-verified claim inspection, used internally by `refresh`.
    pub fn inspect(&self, token: &str) -> Result<Claims, CredentialError> {
        self.decode(token)
    }

    /// Reissue a token from an existing valid one, preserving extra claims
    /// but refreshing `iat`/`exp`.
    pub fn refresh(&self, token: &str) -> Result<String, CredentialError> {
        let claims = self.inspect(token)?;
        if claims.device_id.is_empty() {
            return Err(CredentialError::MissingClaim("device_id"));
        }
        if claims.device_name.is_empty() {
            return Err(CredentialError::MissingClaim("device_name"));
        }
        self.issue(&claims.device_id, &claims.device_name, claims.extra)
    }

    /// Extract full device credentials from a validated token.
    pub fn extract_device_credentials(
        &self,
        token: &str,
    ) -> Result<DeviceCredentials, CredentialError> {
        let claims = self.decode(token)?;
        if claims.token_type != TOKEN_TYPE {
            return Err(CredentialError::WrongType);
        }
        Ok(DeviceCredentials::from_claims(&claims))
    }

    /// Expiry timestamp carried by a (signature-verified) token.
    pub fn expiry(&self, token: &str) -> Result<i64, CredentialError> {
        self.decode(token).map(|c| c.exp)
    }
}

fn parse_algorithm(name: &str) -> Algorithm {
    match name.to_ascii_uppercase().as_str() {
        "HS384" => Algorithm::HS384,
        "HS512" => Algorithm::HS512,
        _ => Algorithm::HS256,
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}
