//! Download token table.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;

/// Random bytes in a token (hex encoded to 32 characters).
pub const TOKEN_BYTES: usize = 16;

/// A prepared archive waiting to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadToken {
    /// Scratch archive on disk.
    pub archive_path: PathBuf,
    /// Name offered to the client, `<dirname>.zip`.
    pub display_name: String,
    /// The token stops working at this instant.
    pub expire_at: DateTime<Utc>,
}

impl DownloadToken {
    /// Whether the token has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at < now
    }
}

/// Generate an unguessable token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Concurrent map of outstanding download tokens.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: DashMap<String, DownloadToken>,
}

impl TokenTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prepared archive and return its token.
    pub fn issue(
        &self,
        archive_path: PathBuf,
        display_name: String,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let token = generate_token();
        self.tokens.insert(
            token.clone(),
            DownloadToken {
                archive_path,
                display_name,
                expire_at: now + ttl,
            },
        );
        token
    }

    /// Look up a token without consuming it.
    pub fn get(&self, token: &str) -> Option<DownloadToken> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }

    /// Remove a token.
    pub fn remove(&self, token: &str) -> Option<DownloadToken> {
        self.tokens.remove(token).map(|(_, value)| value)
    }

    /// Remove and return every token expired at `now`.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<DownloadToken> {
        let expired: Vec<String> = self
            .tokens
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.remove(&token))
            .collect()
    }

    /// Number of outstanding tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are outstanding.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
