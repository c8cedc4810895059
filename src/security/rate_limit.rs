//! Sliding-window rate limiter, keyed by `device_id` or remote address.
//!
//! Ported faithfully from the original window/block-duration algorithm:
//! each identifier gets a one-minute counting window; exceeding the
//! configured threshold inside that window blocks the identifier for
//! `block_duration_seconds`, independent of whether the window has since
//! rolled over.

use std::collections::HashMap;
use std::time::Duration;

const WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
struct RateLimitEntry {
    request_count: u32,
    window_start: chrono::DateTime<chrono::Utc>,
    blocked_until: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct RateLimiter {
    requests_per_minute: u32,
    block_duration: chrono::Duration,
    entries: HashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, block_duration_seconds: u64) -> Self {
        Self {
            requests_per_minute,
            block_duration: chrono::Duration::seconds(block_duration_seconds as i64),
            entries: HashMap::new(),
        }
    }

    /// Check (and record) one request for `identifier`. Returns `Ok(())` if
    /// admitted, or `Err(retry_after_seconds)` if blocked.
    pub fn check(&mut self, identifier: &str) -> Result<(), u64> {
        let now = chrono::Utc::now();

        if let Some(entry) = self.entries.get(identifier) {
            if let Some(blocked_until) = entry.blocked_until {
                if now < blocked_until {
                    let remaining = (blocked_until - now).num_seconds().max(0) as u64;
                    return Err(remaining);
                }
            }
        }

        let window_expired = self
            .entries
            .get(identifier)
            .map(|e| (now - e.window_start).num_seconds() >= WINDOW_SECONDS)
            .unwrap_or(true);

        if window_expired {
            self.entries.insert(
                identifier.to_string(),
                RateLimitEntry {
                    request_count: 1,
                    window_start: now,
                    blocked_until: None,
                },
            );
            return Ok(());
        }

        let entry = self.entries.get_mut(identifier).expect("checked above");
        entry.request_count += 1;

        if entry.request_count > self.requests_per_minute {
            entry.blocked_until = Some(now + self.block_duration);
            let remaining = self.block_duration.num_seconds().max(0) as u64;
            return Err(remaining);
        }

        Ok(())
    }

    /// Remove entries whose windows have been idle for more than
    /// `2 * window_seconds` — a pure housekeeping pass, not part of the
    /// admission decision.
    pub fn sweep(&mut self) {
        let now = chrono::Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| (now - e.window_start).num_seconds() <= WINDOW_SECONDS * 2);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "rate limiter sweeper pruned idle entries");
        }
    }

    pub fn reset(&mut self, identifier: &str) {
        self.entries.remove(identifier);
    }
}

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_configured_limit() {
        let mut limiter = RateLimiter::new(3, 300);
        for _ in 0..3 {
            assert!(limiter.check("device-1").is_ok());
        }
    }

    #[test]
    fn rejects_once_the_limit_is_exceeded() {
        let mut limiter = RateLimiter::new(2, 300);
        assert!(limiter.check("device-1").is_ok());
        assert!(limiter.check("device-1").is_ok());
        assert!(limiter.check("device-1").is_err());
    }

    #[test]
    fn block_persists_for_block_duration_regardless_of_window() {
        // After the first rejection, subsequent checks inside the block
        // window keep failing even though request_count isn't re-evaluated.
        let mut limiter = RateLimiter::new(1, 300);
        assert!(limiter.check("device-1").is_ok());
        assert!(limiter.check("device-1").is_err());
        assert!(limiter.check("device-1").is_err());
    }

    #[test]
    fn distinct_identifiers_are_independent() {
        let mut limiter = RateLimiter::new(1, 300);
        assert!(limiter.check("device-1").is_ok());
        assert!(limiter.check("device-2").is_ok());
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let mut limiter = RateLimiter::new(5, 300);
        limiter.check("device-1").unwrap();
        limiter.sweep();
        assert_eq!(limiter.entries.len(), 1);
    }

    #[test]
    fn reset_clears_an_identifier() {
        let mut limiter = RateLimiter::new(1, 300);
        limiter.check("device-1").unwrap();
        assert!(limiter.check("device-1").is_err());
        limiter.reset("device-1");
        assert!(limiter.check("device-1").is_ok());
    }
}
