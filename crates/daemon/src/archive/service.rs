//! Archive preparation, token redemption and cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use protocol::messages::ArchiveTicket;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::{validate_archive, ArchiveStrategy, ExternalZipStrategy, ZipLibraryStrategy};
use super::tokens::{generate_token, TokenTable};
use super::ArchiveError;
use crate::files::PathResolver;

/// File name prefix of scratch archives.
pub const SCRATCH_PREFIX: &str = "lanshare_";

/// An archive ready to stream.
///
/// Dropping it (normally when the response body finishes or the client
/// goes away) removes the scratch file and, for token downloads, the token.
pub struct ArchiveDownload {
    /// Open archive.
    pub file: File,
    /// Archive size in bytes.
    pub len: u64,
    /// Name offered to the client.
    pub display_name: String,
    /// Cleans up when dropped.
    pub guard: DownloadGuard,
}

/// Removes a scratch archive (and its token) on drop.
pub struct DownloadGuard {
    token: Option<(Arc<TokenTable>, String)>,
    path: PathBuf,
}

impl DownloadGuard {
    fn new(path: PathBuf, token: Option<(Arc<TokenTable>, String)>) -> Self {
        Self { token, path }
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if let Some((tokens, token)) = self.token.take() {
            tokens.remove(&token);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed scratch archive {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch archive"),
        }
    }
}

struct BuiltArchive {
    path: PathBuf,
    display_name: String,
}

/// Builds directory archives and manages their download tokens.
pub struct ArchiveService {
    resolver: Arc<PathResolver>,
    tokens: Arc<TokenTable>,
    strategies: Vec<Arc<dyn ArchiveStrategy>>,
    scratch_dir: PathBuf,
    token_ttl: chrono::Duration,
}

impl ArchiveService {
    /// Create the service, creating the scratch directory if needed.
    pub fn new<P: AsRef<Path>>(
        resolver: Arc<PathResolver>,
        scratch_dir: P,
        token_ttl: Duration,
        strategies: Vec<Arc<dyn ArchiveStrategy>>,
    ) -> Result<Self, ArchiveError> {
        std::fs::create_dir_all(scratch_dir.as_ref())?;
        // The external tool runs in the source directory, so keep this absolute.
        let scratch_dir = std::fs::canonicalize(scratch_dir.as_ref())?;
        let token_ttl = chrono::Duration::from_std(token_ttl)
            .map_err(|e| ArchiveError::Failed(format!("token TTL out of range: {e}")))?;

        Ok(Self {
            resolver,
            tokens: Arc::new(TokenTable::new()),
            strategies,
            scratch_dir,
            token_ttl,
        })
    }

    /// The in-process writer, then the system `zip` when enabled and present.
    pub fn default_strategies(external_tool: bool) -> Vec<Arc<dyn ArchiveStrategy>> {
        let mut strategies: Vec<Arc<dyn ArchiveStrategy>> = vec![Arc::new(ZipLibraryStrategy)];
        if external_tool {
            match ExternalZipStrategy::detect() {
                Some(external) => strategies.push(Arc::new(external)),
                None => debug!("No zip program on PATH, using the built-in writer only"),
            }
        }
        strategies
    }

    /// Outstanding download tokens.
    pub fn tokens(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    /// Directory holding scratch archives.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Pack a directory and issue a download token for it.
    pub async fn prepare(&self, raw: &str, now: DateTime<Utc>) -> Result<ArchiveTicket, ArchiveError> {
        let built = self.build(raw).await?;
        let token = self
            .tokens
            .issue(built.path, built.display_name.clone(), self.token_ttl, now);
        info!("Prepared archive {} for {}", built.display_name, raw);
        Ok(ArchiveTicket {
            token,
            zip_file_name: built.display_name,
        })
    }

    /// Redeem a token.
    ///
    /// An expired token is dropped along with its archive. A token whose
    /// archive vanished is treated as expired.
    pub async fn fetch(&self, token: &str, now: DateTime<Utc>) -> Result<ArchiveDownload, ArchiveError> {
        let entry = self.tokens.get(token).ok_or(ArchiveError::TokenNotFound)?;

        if entry.is_expired(now) {
            self.tokens.remove(token);
            remove_scratch(&entry.archive_path).await;
            return Err(ArchiveError::TokenExpired);
        }

        let file = match File::open(&entry.archive_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.tokens.remove(token);
                return Err(ArchiveError::TokenExpired);
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();

        Ok(ArchiveDownload {
            file,
            len,
            display_name: entry.display_name,
            guard: DownloadGuard::new(
                entry.archive_path,
                Some((Arc::clone(&self.tokens), token.to_string())),
            ),
        })
    }

    /// Pack a directory for immediate streaming, without a token.
    pub async fn archive_inline(&self, raw: &str) -> Result<ArchiveDownload, ArchiveError> {
        let built = self.build(raw).await?;
        // Guard first so a failed open still cleans up.
        let guard = DownloadGuard::new(built.path.clone(), None);
        let file = File::open(&built.path).await?;
        let len = file.metadata().await?.len();
        Ok(ArchiveDownload {
            file,
            len,
            display_name: built.display_name,
            guard,
        })
    }

    /// Drop tokens that expired by `now` and delete their archives.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired = self.tokens.take_expired(now);
        for entry in &expired {
            remove_scratch(&entry.archive_path).await;
        }
        if !expired.is_empty() {
            info!("Expired {} download tokens", expired.len());
        }
        expired.len()
    }

    /// Delete scratch archives left behind by a previous process.
    pub fn purge_stale(&self) -> std::io::Result<usize> {
        let mut purged = 0;
        for entry in std::fs::read_dir(&self.scratch_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(SCRATCH_PREFIX) && name.ends_with(".zip")) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if purged > 0 {
            info!("Purged {} stale scratch archives from {:?}", purged, self.scratch_dir);
        }
        Ok(purged)
    }

    /// Run the token sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Archive token sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_expired(Utc::now()).await;
                    }
                }
            }
        })
    }

    async fn build(&self, raw: &str) -> Result<BuiltArchive, ArchiveError> {
        let target = self.resolver.resolve(raw)?;
        match tokio::fs::metadata(&target.absolute).await {
            Ok(stat) if stat.is_dir() => {}
            Ok(_) => return Err(ArchiveError::NotADirectory(target.relative)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(target.relative))
            }
            Err(e) => return Err(e.into()),
        }

        let display_name = format!("{}.zip", target.name());
        let dest = self
            .scratch_dir
            .join(format!("{SCRATCH_PREFIX}{}.zip", generate_token()));

        let strategies = self.strategies.clone();
        let source = target.absolute.clone();
        let scratch = dest.clone();
        tokio::task::spawn_blocking(move || pack_with_fallback(&strategies, &source, &scratch))
            .await
            .map_err(|e| ArchiveError::Failed(format!("packing task failed: {e}")))??;

        Ok(BuiltArchive {
            path: dest,
            display_name,
        })
    }
}

/// Try each strategy in order; the first validated archive wins.
fn pack_with_fallback(
    strategies: &[Arc<dyn ArchiveStrategy>],
    source: &Path,
    dest: &Path,
) -> Result<u64, ArchiveError> {
    let mut failures = Vec::new();
    for strategy in strategies {
        match strategy.pack(source, dest).and_then(|()| validate_archive(dest)) {
            Ok(size) => {
                debug!("Packed {:?} with {} ({} bytes)", source, strategy.name(), size);
                return Ok(size);
            }
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Archive strategy failed");
                failures.push(format!("{}: {}", strategy.name(), e));
                match std::fs::remove_file(dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %dest.display(), error = %e, "Failed to remove partial archive")
                    }
                }
            }
        }
    }
    if failures.is_empty() {
        failures.push("no archive strategy configured".to_string());
    }
    Err(ArchiveError::Failed(failures.join("; ")))
}

async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch archive"),
    }
}
