//! Append-only audit log.
//!
//! One line per mutating action:
//!
//! ```text
//! 2024-05-01T12:00:00.000Z | upload | 192.168.1.20 | alice | docs/report.pdf | 1024 bytes
//! ```
//!
//! Fields are joined by ` | `. Inside a field `|` is escaped as `\|` and any
//! run of CR/LF collapses to one space, so each record stays a single line.
//! The log lives outside the storage root at `<data_dir>/audit.log`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::identity::Actor;

/// Lines returned when no limit is given.
pub const DEFAULT_READ_LIMIT: usize = 300;

/// Upper bound on lines returned by one read.
pub const MAX_READ_LIMIT: usize = 1000;

/// Field separator.
const SEPARATOR: &str = " | ";

/// Errors from the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// IO error reading or appending.
    #[error("audit log IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Upload,
    Mkdir,
    Delete,
    Rename,
    Move,
    Upgrade,
    Download,
}

impl AuditAction {
    /// Name written into the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "upload",
            AuditAction::Mkdir => "mkdir",
            AuditAction::Delete => "delete",
            AuditAction::Rename => "rename",
            AuditAction::Move => "move",
            AuditAction::Upgrade => "upgrade",
            AuditAction::Download => "download",
        }
    }
}

/// Make a value safe to embed as one field of one line.
pub fn sanitize_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_break = false;
    for c in value.chars() {
        match c {
            '\r' | '\n' => {
                if !in_break {
                    out.push(' ');
                }
                in_break = true;
                continue;
            }
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            other => out.push(other),
        }
        in_break = false;
    }
    out.trim().to_string()
}

/// Format one record.
pub fn format_line(
    at: DateTime<Utc>,
    action: AuditAction,
    actor: &Actor,
    target: &str,
    detail: &str,
) -> String {
    [
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        action.as_str().to_string(),
        sanitize_field(&actor.ip),
        sanitize_field(&actor.name),
        sanitize_field(target),
        sanitize_field(detail),
    ]
    .join(SEPARATOR)
}

/// Clamp a requested read size to `1..=MAX_READ_LIMIT`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_READ_LIMIT).clamp(1, MAX_READ_LIMIT)
}

/// Audit log writer and reader.
pub struct AuditLog {
    path: PathBuf,
    /// Serializes appends.
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create a log writing to `path`. Nothing is touched until the first append.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub async fn append(
        &self,
        action: AuditAction,
        actor: &Actor,
        target: &str,
        detail: &str,
    ) -> Result<(), AuditError> {
        let mut line = format_line(Utc::now(), action, actor, target, detail);
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append one record; a failure is logged and otherwise ignored.
    pub async fn record(&self, action: AuditAction, actor: &Actor, target: &str, detail: &str) {
        if let Err(e) = self.append(action, actor, target, detail).await {
            tracing::warn!(action = action.as_str(), path = %target, error = %e, "Failed to write audit record");
        }
    }

    /// Most recent lines, newest first.
    ///
    /// `limit` is clamped with [`clamp_limit`]. A missing log reads as empty.
    pub async fn read_recent(&self, limit: Option<usize>) -> Result<Vec<String>, AuditError> {
        let limit = clamp_limit(limit);
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        Ok(lines
            .iter()
            .rev()
            .take(limit)
            .map(|l| l.to_string())
            .collect())
    }
}
