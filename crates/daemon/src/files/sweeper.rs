//! Expiry sweeper for temporary uploads.
//!
//! Temporary files are deleted once their TTL has fully elapsed. The sweep
//! runs on a fixed interval and also right before listings and downloads so
//! clients never see a file that is already past its expiry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metadata::MetadataStore;
use super::resolver::{PathResolver, ResolveError};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys whose file and metadata were removed.
    pub removed: Vec<String>,
    /// Expired keys kept because the file could not be deleted.
    pub retained: Vec<String>,
}

impl SweepReport {
    /// Whether the sweep changed the metadata map.
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Deletes expired temporary files and their metadata.
pub struct ExpirySweeper {
    resolver: Arc<PathResolver>,
    metadata: Arc<MetadataStore>,
    ttl: chrono::Duration,
}

impl ExpirySweeper {
    /// Create a sweeper for files older than `ttl`.
    pub fn new(resolver: Arc<PathResolver>, metadata: Arc<MetadataStore>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        Self {
            resolver,
            metadata,
            ttl,
        }
    }

    /// Lifetime of a temporary file.
    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Sweep against the current clock.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweep(Utc::now()).await
    }

    /// Delete every temporary file whose TTL has elapsed at `now`.
    ///
    /// A file that is already gone still has its metadata removed. Any other
    /// deletion failure keeps the entry for the next sweep. The snapshot is
    /// persisted only when something was removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut expired: Vec<String> = self
            .metadata
            .snapshot()?
            .into_iter()
            .filter(|(_, meta)| meta.is_expired(now, self.ttl))
            .map(|(key, _)| key)
            .collect();
        expired.sort();

        let mut report = SweepReport::default();
        for key in expired {
            // An upgrade may have landed since the snapshot was taken.
            match self.metadata.get(&key)? {
                Some(meta) if meta.is_expired(now, self.ttl) => {}
                _ => continue,
            }

            match self.delete_file(&key).await {
                Ok(()) => report.removed.push(key),
                Err(e) => {
                    warn!(path = %key, error = %e, "Failed to delete expired file, keeping entry");
                    report.retained.push(key);
                }
            }
        }

        if report.changed() {
            self.metadata.remove_many(&report.removed)?;
            self.metadata.save()?;
            info!("Expiry sweep removed {} files", report.removed.len());
        } else {
            debug!("Expiry sweep found nothing to remove");
        }
        Ok(report)
    }

    /// Remove the file behind `key`; "already absent" counts as success.
    async fn delete_file(&self, key: &str) -> std::io::Result<()> {
        let resolved = match self.resolver.resolve(key) {
            Ok(resolved) => resolved,
            Err(ResolveError::IllegalPath(_)) => {
                // Nothing on disk can belong to this key.
                warn!(path = %key, "Dropping metadata entry with illegal path");
                return Ok(());
            }
            Err(ResolveError::Io(e)) => return Err(e),
            Err(ResolveError::InvalidName(_)) => return Ok(()),
        };

        match tokio::fs::symlink_metadata(&resolved.absolute).await {
            Ok(stat) if stat.is_dir() => Ok(()),
            Ok(_) => match tokio::fs::remove_file(&resolved.absolute).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run the sweep every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; startup already swept.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Expiry sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_now().await {
                            warn!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }
        })
    }
}
