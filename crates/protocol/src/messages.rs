//! API message definitions for LanShare.
//!
//! This module defines the JSON shapes exchanged between the daemon and its
//! clients. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError, Result};

/// Placeholder uploader name for files without recorded metadata.
pub const UNKNOWN_UPLOADER: &str = "unknown";

/// Successful response wrapper.
///
/// Flattens the body next to an `ok: true` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<T> {
    /// Always `true` for a reply.
    pub ok: bool,
    /// The operation-specific body.
    #[serde(flatten)]
    pub body: T,
}

impl<T> Reply<T> {
    /// Wrap a body into a successful reply.
    pub fn ok(body: T) -> Self {
        Self { ok: true, body }
    }
}

/// Failed response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub ok: bool,
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ErrorBody {
    /// Create an error body.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct OkFlag {
    ok: bool,
}

/// Decode a JSON response, turning an error body into [`ProtocolError::Remote`].
pub fn decode_reply<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let flag: OkFlag = serde_json::from_slice(bytes)?;
    if flag.ok {
        let reply: Reply<T> = serde_json::from_slice(bytes)?;
        Ok(reply.body)
    } else {
        let err: ErrorBody = serde_json::from_slice(bytes)?;
        Err(ProtocolError::Remote {
            code: err.code,
            message: err.message,
        })
    }
}

// Listing

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A directory.
    Folder,
    /// A regular file.
    File,
}

/// Lifecycle class of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Directories have no lifecycle.
    Folder,
    /// Swept once its TTL elapses.
    Temporary,
    /// Kept until explicitly deleted.
    Permanent,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// File or folder name.
    pub name: String,
    /// Canonical path relative to the storage root.
    pub path: String,
    /// Folder or file.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Filesystem modification time.
    pub modified_at: DateTime<Utc>,
    /// Uploader display name.
    pub uploader: String,
    /// Uploader network address, when recorded.
    #[serde(rename = "uploaderIP")]
    pub uploader_ip: Option<String>,
    /// Upload time; modification time when nothing was recorded.
    pub uploaded_at: DateTime<Utc>,
    /// When a temporary file becomes eligible for the sweep.
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifecycle class.
    pub storage_type: StorageType,
}

/// Query string carrying a relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    /// Relative path; absent means the root.
    #[serde(default)]
    pub path: Option<String>,
}

/// Body of a listing reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Canonical path of the listed directory ("" for the root).
    pub path: String,
    /// Folders first, then files, each group by name.
    pub files: Vec<FileEntry>,
}

// Folder operations

/// Create a folder named `name` inside `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFolderRequest {
    /// Parent directory.
    #[serde(default)]
    pub path: String,
    /// New folder name.
    pub name: String,
}

/// Rename the entry at `path` to `new_name` in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    /// Entry to rename.
    pub path: String,
    /// New name.
    pub new_name: String,
}

/// Move the entry at `path` into `target_folder_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    /// Entry to move.
    pub path: String,
    /// Destination directory ("" for the root).
    #[serde(default)]
    pub target_folder_path: String,
}

/// Request carrying one entry path (delete, upgrade, archive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRequest {
    /// Entry path.
    pub path: String,
}

/// Result of a mutation that touched one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChanged {
    /// Canonical path after the operation.
    pub path: String,
}

/// Result of a rename or move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relocated {
    /// Path before the operation.
    pub old_path: String,
    /// Path after the operation.
    pub new_path: String,
}

/// Result of a permanent upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upgraded {
    /// Upgraded file.
    pub path: String,
    /// When the upgrade was recorded.
    pub upgraded_at: DateTime<Utc>,
}

// Upload

/// Query string of an upload request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQuery {
    /// Destination directory.
    #[serde(default)]
    pub path: Option<String>,
    /// Uploader identifier; falls back to the `x-user-id` header.
    #[serde(default)]
    pub uploader: Option<String>,
}

/// A part that could not be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFailure {
    /// The name the part declared.
    pub name: String,
    /// Why it failed.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Summary of an upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    /// Number of stored files.
    pub uploaded_count: usize,
    /// Canonical paths of stored files, in part order.
    pub uploaded: Vec<String>,
    /// Parts that failed; siblings are not rolled back.
    pub failed: Vec<UploadFailure>,
}

// Archive

/// First phase of a directory download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveTicket {
    /// Opaque download token (32 hex characters).
    pub token: String,
    /// Suggested file name, `<dirname>.zip`.
    pub zip_file_name: String,
}

/// Query string of a download request: exactly one of the two is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQuery {
    /// Token from [`ArchiveTicket`].
    #[serde(default)]
    pub token: Option<String>,
    /// Direct path of a file or directory.
    #[serde(default)]
    pub path: Option<String>,
}

// Audit log and server info

/// Query string of an audit or server log read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Number of records. Audit reads clamp to 1..=1000 (default 300),
    /// server log reads to 1..=500 (default 200).
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Most recent audit lines, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLines {
    /// Raw log lines.
    pub lines: Vec<String>,
}

/// Severity of a captured server log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerLogLevel {
    Error,
    Warn,
    Info,
}

/// One captured daemon log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLogEntry {
    /// When the event was emitted.
    pub ts: DateTime<Utc>,
    pub level: ServerLogLevel,
    /// Message followed by any `key=value` fields.
    pub msg: String,
}

/// Recent server log entries, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLogs {
    pub entries: Vec<ServerLogEntry>,
    /// Entries currently held, before the limit was applied.
    pub total: usize,
}

/// Liveness reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Server clock.
    pub now: DateTime<Utc>,
}

/// Server details as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Configured host (admin) address.
    pub host_address: String,
    /// Listening port.
    pub port: u16,
    /// Caller address as the server sees it.
    pub client_ip: String,
    /// Caller display name.
    pub client_name: String,
    /// Whether the caller may run admin operations.
    pub is_admin: bool,
}
