//! Layered configuration for the relay and bridge-client binaries.
//!
//! Precedence, lowest to highest: compiled-in defaults → optional config
//! file (`--config path.toml`) → environment variables → CLI flags. CLI
//! flags and env vars are merged in by the caller (`main.rs`); this module
//! only defines the typed shape and the defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "entorelay";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_log_filter() -> String {
    format!("{APP_NAME}=info,tower_http=warn,axum=warn")
}

pub fn default_log_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_log_filter()))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_expiry_hours: i64,
    pub pairing_session_expiry_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".to_string(),
            jwt_expiry_hours: 24 * 30,
            pairing_session_expiry_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MobileChannelConfig {
    pub enabled: bool,
    pub websocket_port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for MobileChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            websocket_port: 8787,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            max_connections: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnterpriseConfig {
    pub rate_limit_enabled: bool,
    pub rate_limit_requests_per_minute: u32,
    pub rate_limit_block_duration_secs: u64,
    pub audit_log_enabled: bool,
    pub audit_log_path: PathBuf,
    pub audit_log_max_file_size_mb: u64,
    pub audit_log_max_files: u32,
    pub ip_whitelist_enabled: bool,
    pub ip_whitelist: Vec<String>,
}

impl Default for EnterpriseConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            rate_limit_requests_per_minute: 60,
            rate_limit_block_duration_secs: 300,
            audit_log_enabled: true,
            audit_log_path: PathBuf::from("relay-audit.log"),
            audit_log_max_file_size_mb: 100,
            audit_log_max_files: 10,
            ip_whitelist_enabled: false,
            ip_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayTopConfig {
    pub public_url: String,
    pub bridge_token: String,
}

impl Default for RelayTopConfig {
    fn default() -> Self {
        Self {
            public_url: String::new(),
            bridge_token: String::new(),
        }
    }
}

/// Full relay-process configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub auth: AuthConfig,
    pub mobile: MobileChannelConfig,
    pub enterprise: EnterpriseConfig,
    pub network: NetworkConfig,
    pub relay: RelayTopConfig,
}

impl RelayConfig {
    /// Load defaults, then an optional config file, then environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, crate::error::RelayError> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)
                    .map_err(|e| crate::error::RelayError::Config(format!("{p:?}: {e}")))?
            }
            None => RelayConfig::default(),
        };

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                cfg.mobile.websocket_port = p;
            }
        }
        if let Ok(token) = std::env::var("BRIDGE_TOKEN") {
            cfg.relay.bridge_token = token;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            cfg.auth.jwt_secret = secret;
        }
        if let Ok(url) = std::env::var("RELAY_PUBLIC_URL") {
            cfg.relay.public_url = url;
        }

        if cfg.mobile.tls_enabled
            && (cfg.mobile.tls_cert_path.is_none() || cfg.mobile.tls_key_path.is_none())
        {
            return Err(crate::error::RelayError::Config(
                "mobile.tls_enabled requires both tls_cert_path and tls_key_path".to_string(),
            ));
        }

        Ok(cfg)
    }
}

/// Bridge-client-process configuration. Much smaller: it just needs to know
/// where to dial and what shared secret to present.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeClientConfig {
    pub relay_url: String,
    pub bridge_token: String,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8787/bridge".to_string(),
            bridge_token: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_config_defaults_are_sane() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.mobile.websocket_port, 8787);
        assert_eq!(cfg.auth.jwt_expiry_hours, 720);
        assert_eq!(cfg.enterprise.rate_limit_requests_per_minute, 60);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("JWT_SECRET", "test-secret-from-env-0123456789ab");
        let cfg = RelayConfig::load(None).unwrap();
        assert_eq!(cfg.auth.jwt_secret, "test-secret-from-env-0123456789ab");
        std::env::remove_var("JWT_SECRET");
    }

    #[test]
    fn tls_enabled_without_cert_paths_is_rejected() {
        let toml = "[mobile]\ntls_enabled = true\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, toml).unwrap();
        assert!(RelayConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn tls_enabled_with_cert_paths_loads() {
        let toml = "[mobile]\ntls_enabled = true\ntls_cert_path = \"cert.pem\"\ntls_key_path = \"key.pem\"\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, toml).unwrap();
        let cfg = RelayConfig::load(Some(&path)).unwrap();
        assert!(cfg.mobile.tls_enabled);
    }
}
