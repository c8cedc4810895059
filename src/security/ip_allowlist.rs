//! IP allowlist, checked against the peer address of incoming connections.
//!
//! No crate in this workspace's dependency stack parses CIDR notation, so
//! entries are parsed by hand against `std::net::IpAddr`. Only IPv4 and
//! IPv6 literals and CIDR ranges are accepted; anything else is rejected
//! at construction time rather than silently ignored.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy)]
enum Entry {
    V4 { base: u32, prefix: u32 },
    V6 { base: u128, prefix: u32 },
}

pub struct IpAllowlist {
    enabled: bool,
    entries: Vec<Entry>,
}

impl IpAllowlist {
    /// `raw` entries are either bare IPs (`"127.0.0.1"`) or CIDR ranges
    /// (`"10.0.0.0/8"`). Malformed entries are dropped with a warning rather
    /// than failing startup. If `enabled` is true but no entries parsed,
    /// every address is rejected — matching the "explicit allowlist" intent.
    pub fn new(enabled: bool, raw: &[String]) -> Self {
        let mut entries = Vec::new();
        for item in raw {
            match parse_entry(item) {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(entry = %item, "ignoring malformed ip_whitelist entry"),
            }
        }

        if enabled && entries.is_empty() {
            tracing::warn!("ip_whitelist_enabled is true but no valid entries were configured; all connections will be rejected");
        }

        Self { enabled, entries }
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        self.entries.iter().any(|e| e.contains(addr))
    }
}

impl Entry {
    fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Entry::V4 { base, prefix }, IpAddr::V4(ip)) => {
                let mask = mask32(*prefix);
                (u32::from(ip) & mask) == (base & mask)
            }
            (Entry::V6 { base, prefix }, IpAddr::V6(ip)) => {
                let mask = mask128(*prefix);
                (u128::from(ip) & mask) == (base & mask)
            }
            _ => false,
        }
    }
}

fn mask32(prefix: u32) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn mask128(prefix: u32) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

fn parse_entry(raw: &str) -> Option<Entry> {
    let raw = raw.trim();
    let (addr_part, prefix_part) = match raw.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (raw, None),
    };

    let addr: IpAddr = addr_part.parse().ok()?;

    match addr {
        IpAddr::V4(ip) => {
            let prefix = match prefix_part {
                Some(p) => p.parse::<u32>().ok()?,
                None => 32,
            };
            if prefix > 32 {
                return None;
            }
            Some(Entry::V4 { base: u32::from(ip), prefix })
        }
        IpAddr::V6(ip) => {
            let prefix = match prefix_part {
                Some(p) => p.parse::<u32>().ok()?,
                None => 128,
            };
            if prefix > 128 {
                return None;
            }
            Some(Entry::V6 { base: u128::from(ip), prefix })
        }
    }
}
