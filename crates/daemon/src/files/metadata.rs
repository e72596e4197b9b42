//! Persistent per-file metadata.
//!
//! Maps canonical relative paths to [`FileMetadata`]. The whole map is
//! written as one JSON snapshot after a mutation; there is no write-ahead log.
//! The snapshot lives outside the storage root at
//! `<data_dir>/file_meta.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use protocol::messages::UNKNOWN_UPLOADER;
use serde::{Deserialize, Serialize};

/// Snapshot format version written by [`MetadataStore::save`].
const SNAPSHOT_VERSION: u32 = 1;

fn unknown_uploader() -> String {
    UNKNOWN_UPLOADER.to_string()
}

/// Metadata recorded for an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Uploader display name.
    #[serde(default = "unknown_uploader")]
    pub uploader: String,
    /// Uploader network address.
    #[serde(rename = "uploaderIP", default)]
    pub uploader_ip: Option<String>,
    /// When the upload completed.
    pub uploaded_at: DateTime<Utc>,
    /// Permanent files are never swept.
    #[serde(default)]
    pub is_permanent: bool,
    /// When the file was upgraded to permanent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgraded_at: Option<DateTime<Utc>>,
}

impl FileMetadata {
    /// Metadata for a freshly uploaded temporary file.
    pub fn temporary(uploader: String, uploader_ip: Option<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            uploader,
            uploader_ip,
            uploaded_at,
            is_permanent: false,
            upgraded_at: None,
        }
    }

    /// When this file becomes eligible for the sweep; `None` if permanent.
    pub fn expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        (!self.is_permanent).then(|| self.uploaded_at + ttl)
    }

    /// Whether the TTL has fully elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        !self.is_permanent && now - self.uploaded_at >= ttl
    }
}

/// On-disk snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataSnapshot {
    version: u32,
    files: HashMap<String, FileMetadata>,
}

/// Accepted snapshot layouts; older installs wrote the bare map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFormat {
    Versioned(MetadataSnapshot),
    Legacy(HashMap<String, FileMetadata>),
}

/// Whether `key` is `prefix` itself or lies beneath it.
fn is_in_tree(key: &str, prefix: &str) -> bool {
    key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key.as_bytes()[prefix.len()] == b'/')
}

/// Rewrite every key equal to `from` or under `from/` onto `to`.
///
/// The rest of each key and all values are preserved. Keys that merely share
/// a textual prefix (`a/bx` for `a/b`) are left alone.
pub fn rename_keys(
    entries: &HashMap<String, FileMetadata>,
    from: &str,
    to: &str,
) -> HashMap<String, FileMetadata> {
    entries
        .iter()
        .map(|(key, meta)| {
            let key = if is_in_tree(key, from) {
                format!("{to}{}", &key[from.len()..])
            } else {
                key.clone()
            };
            (key, meta.clone())
        })
        .collect()
}

/// Thread-safe metadata map with JSON snapshot persistence.
pub struct MetadataStore {
    /// Path to the snapshot file.
    path: PathBuf,
    /// Metadata keyed by canonical relative path.
    entries: RwLock<HashMap<String, FileMetadata>>,
    /// Serializes snapshot writes so temp files never interleave.
    save_lock: Mutex<()>,
}

impl MetadataStore {
    /// Create an empty store persisting to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(HashMap::new()),
            save_lock: Mutex::new(()),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, FileMetadata>>> {
        self.entries
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on metadata store"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, FileMetadata>>> {
        self.entries
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on metadata store"))
    }

    /// Load the snapshot from disk, replacing the in-memory map.
    ///
    /// A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Metadata file not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read metadata file: {}", self.path.display()))?;

        let files = match serde_json::from_str::<SnapshotFormat>(&contents)
            .with_context(|| format!("Failed to parse metadata file: {}", self.path.display()))?
        {
            SnapshotFormat::Versioned(snapshot) => {
                if snapshot.version > SNAPSHOT_VERSION {
                    tracing::warn!(
                        "Metadata snapshot version {} is newer than supported {}",
                        snapshot.version,
                        SNAPSHOT_VERSION
                    );
                }
                snapshot.files
            }
            SnapshotFormat::Legacy(files) => {
                tracing::info!("Upgrading legacy metadata snapshot at {:?}", self.path);
                files
            }
        };

        let mut entries = self.write()?;
        *entries = files;
        tracing::info!("Loaded metadata for {} files from {:?}", entries.len(), self.path);
        Ok(())
    }

    /// Write the full snapshot atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let _guard = self
            .save_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire metadata save lock"))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metadata directory: {}", parent.display())
            })?;
        }

        let snapshot = MetadataSnapshot {
            version: SNAPSHOT_VERSION,
            files: self.read()?.clone(),
        };
        let contents =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize metadata")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp metadata file: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp metadata file {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved metadata for {} files to {:?}", snapshot.files.len(), self.path);
        Ok(())
    }

    /// Get the metadata for one path.
    pub fn get(&self, key: &str) -> Result<Option<FileMetadata>> {
        Ok(self.read()?.get(key).cloned())
    }

    /// Clone the whole map.
    pub fn snapshot(&self) -> Result<HashMap<String, FileMetadata>> {
        Ok(self.read()?.clone())
    }

    /// Insert or replace the metadata for one path.
    pub fn insert(&self, key: String, meta: FileMetadata) -> Result<()> {
        self.write()?.insert(key, meta);
        Ok(())
    }

    /// Mark a file permanent, creating its entry if none was recorded.
    ///
    /// `fallback_uploaded_at` is used when no upload time exists (typically
    /// the file's modification time); an existing upload time is kept.
    pub fn mark_permanent(
        &self,
        key: &str,
        fallback_uploaded_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FileMetadata> {
        let mut entries = self.write()?;
        let meta = entries.entry(key.to_string()).or_insert_with(|| FileMetadata {
            uploader: unknown_uploader(),
            uploader_ip: None,
            uploaded_at: fallback_uploaded_at,
            is_permanent: false,
            upgraded_at: None,
        });
        meta.is_permanent = true;
        meta.upgraded_at = Some(now);
        Ok(meta.clone())
    }

    /// Move every key in the `from` tree onto `to`. Returns how many moved.
    pub fn rename_tree(&self, from: &str, to: &str) -> Result<usize> {
        if from.is_empty() || to.is_empty() || from == to {
            return Ok(0);
        }

        let mut entries = self.write()?;
        let moved = entries.keys().filter(|k| is_in_tree(k, from)).count();
        if moved > 0 {
            *entries = rename_keys(&entries, from, to);
        }
        Ok(moved)
    }

    /// Remove `target` and every key beneath it. Returns how many went.
    pub fn delete_tree(&self, target: &str) -> Result<usize> {
        if target.is_empty() {
            return Ok(0);
        }

        let mut entries = self.write()?;
        let before = entries.len();
        let next: HashMap<_, _> = entries
            .iter()
            .filter(|(k, _)| !is_in_tree(k, target))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        *entries = next;
        Ok(before - entries.len())
    }

    /// Remove a set of keys. Returns how many existed.
    pub fn remove_many(&self, keys: &[String]) -> Result<usize> {
        let mut entries = self.write()?;
        Ok(keys.iter().filter(|k| entries.remove(k.as_str()).is_some()).count())
    }

    /// Number of tracked files.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Whether no files are tracked.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }
}
