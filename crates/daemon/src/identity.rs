//! Caller identity.
//!
//! Maps a caller's network address to a display name and decides whether
//! the caller is the admin (the machine hosting the share).

use std::collections::HashMap;
use std::net::IpAddr;

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Normalized caller address.
    pub ip: String,
    /// Display name.
    pub name: String,
}

impl Actor {
    /// Create an actor.
    pub fn new(ip: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            name: name.into(),
        }
    }

    /// Actor used for work the daemon does on its own (sweeps, CLI).
    pub fn system() -> Self {
        Self::new("127.0.0.1", "system")
    }
}

/// Resolves network addresses to display names.
pub trait IdentityResolver: Send + Sync {
    /// Display name for a normalized address.
    fn display_name(&self, ip: &str) -> String;
}

/// Address to name table loaded from configuration.
#[derive(Debug, Clone)]
pub struct StaticIdentities {
    names: HashMap<String, String>,
    fallback: String,
}

impl StaticIdentities {
    /// Create a table. Keys are normalized so `::ffff:10.0.0.2` and
    /// `10.0.0.2` name the same caller.
    pub fn new(names: &HashMap<String, String>, fallback: impl Into<String>) -> Self {
        Self {
            names: names
                .iter()
                .map(|(ip, name)| (normalize_ip(ip), name.clone()))
                .collect(),
            fallback: fallback.into(),
        }
    }
}

impl IdentityResolver for StaticIdentities {
    fn display_name(&self, ip: &str) -> String {
        self.names
            .get(&normalize_ip(ip))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Normalize an address: IPv4-mapped IPv6 is unwrapped and IPv6 loopback
/// becomes `127.0.0.1`.
pub fn normalize_ip(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                v4.to_string()
            } else if v6.is_loopback() {
                "127.0.0.1".to_string()
            } else {
                v6.to_string()
            }
        }
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => trimmed.trim_start_matches("::ffff:").to_string(),
    }
}

/// Whether `ip` belongs to the admin: the configured host address or loopback.
pub fn is_admin(ip: &str, host_address: &str) -> bool {
    let ip = normalize_ip(ip);
    if ip.parse::<IpAddr>().map(|a| a.is_loopback()).unwrap_or(false) {
        return true;
    }
    let host = host_address.trim();
    !host.is_empty() && ip == normalize_ip(host)
}
