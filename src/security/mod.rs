//! Security Hardening: the collaborators shared by the Mobile Gateway and
//! Bridge Tunnel — sliding-window rate limiting, IP allowlisting, input
//! validation, and the append-only rotating audit log.

pub mod audit;
pub mod ip_allowlist;
pub mod rate_limit;
pub mod validator;

pub use audit::{AuditEvent, AuditLogger};
pub use ip_allowlist::IpAllowlist;
pub use rate_limit::RateLimiter;
pub use validator::InputValidator;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("remote address is not allowed")]
    IpNotAllowed,

    #[error("invalid device_info: {0}")]
    InvalidDeviceInfo(String),

    #[error("invalid message content: {0}")]
    InvalidMessageContent(String),
}
