//! Input validation for pairing `device_info` payloads and mobile message
//! content, plus a sanitizer applied before content is logged or forwarded.

use once_cell::sync::Lazy;
use regex::Regex;

const DEVICE_NAME_MAX_LEN: usize = 50;
const MESSAGE_MIN_LEN: usize = 1;
const MESSAGE_MAX_LEN: usize = 100_000;

static DEVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9 _-]{1,50}$").expect("valid regex"));

static XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"),
        Regex::new(r"(?i)javascript:").expect("valid regex"),
        Regex::new(r"(?i)on\w+\s*=").expect("valid regex"),
    ]
});

const ALLOWED_PLATFORMS: &[&str] = &["ios", "android", "web", "desktop"];

pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a pairing `device_info` payload: `device_name` must match
    /// the allowed character set and length, `platform` must be a known
    /// value.
    pub fn validate_device_info(&self, device_name: &str, platform: &str) -> Result<(), String> {
        if device_name.is_empty() || device_name.len() > DEVICE_NAME_MAX_LEN {
            return Err(format!(
                "device_name must be 1-{DEVICE_NAME_MAX_LEN} characters"
            ));
        }
        if !DEVICE_NAME_RE.is_match(device_name) {
            return Err(
                "device_name may only contain letters, digits, spaces, '_' and '-'".to_string(),
            );
        }
        if !ALLOWED_PLATFORMS.contains(&platform) {
            return Err(format!(
                "platform must be one of {ALLOWED_PLATFORMS:?}, got {platform:?}"
            ));
        }
        Ok(())
    }

    /// Validate message content length and reject obvious XSS payloads.
    /// This is a defense-in-depth check: the content is relayed verbatim
    /// between devices, never rendered as HTML by this process.
    pub fn validate_message_content(&self, content: &str) -> Result<(), String> {
        let len = content.len();
        if len < MESSAGE_MIN_LEN || len > MESSAGE_MAX_LEN {
            return Err(format!(
                "message content must be {MESSAGE_MIN_LEN}-{MESSAGE_MAX_LEN} bytes, got {len}"
            ));
        }
        for pattern in XSS_PATTERNS.iter() {
            if pattern.is_match(content) {
                return Err("message content contains a disallowed pattern".to_string());
            }
        }
        Ok(())
    }

    /// Strip NUL bytes, collapse runs of whitespace, and truncate to the
    /// maximum allowed message length. Applied to content before it's
    /// written to the audit log or displayed, never to content being
    /// relayed between devices.
    pub fn sanitize(&self, content: &str) -> String {
        let without_nul: String = content.chars().filter(|c| *c != '\0').collect();
        let collapsed = without_nul.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.len() > MESSAGE_MAX_LEN {
            collapsed.chars().take(MESSAGE_MAX_LEN).collect()
        } else {
            collapsed
        }
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}
