//! Streamed multipart uploads.
//!
//! Each file part is written straight to its final location by a dedicated
//! writer task fed through a bounded channel, so memory use does not depend
//! on file size. The reader keeps pulling the request body while earlier
//! parts are still being flushed; the request completes once every writer
//! has finished.
//!
//! A part fails on its own. Its siblings are kept and the summary lists both
//! the stored paths and the failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metadata::{FileMetadata, MetadataStore};
use super::resolver::{sanitize_relative_path, PathResolver, ResolveError};

/// Chunks buffered between the body reader and one writer task.
pub const CHUNK_CHANNEL_CAPACITY: usize = 16;

/// Attempts at finding a free `name-N.ext` before giving up.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Errors that can occur while uploading.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The destination escapes the storage root.
    #[error("illegal path: {0}")]
    IllegalPath(String),

    /// The part grew past the per-file limit.
    #[error("file exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    /// The body ended before the part was complete.
    #[error("upload of {0} was interrupted")]
    Truncated(String),

    /// The multipart body could not be parsed.
    #[error("malformed multipart body: {0}")]
    Multipart(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ResolveError> for UploadError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::IllegalPath(p) | ResolveError::InvalidName(p) => UploadError::IllegalPath(p),
            ResolveError::Io(e) => UploadError::Io(e),
        }
    }
}

/// A stream of file parts.
///
/// Non-file fields are skipped by the implementation. Moving to the next
/// part discards whatever is left of the current one.
#[allow(async_fn_in_trait)]
pub trait PartSource {
    /// Advance to the next file part and return the name it declares.
    async fn next_part(&mut self) -> Result<Option<String>, UploadError>;

    /// Next chunk of the current part, `None` once the part is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, UploadError>;
}

/// Message from the reader to a writer task.
#[derive(Debug)]
enum Chunk {
    Data(Bytes),
    /// The part is complete. A channel closed without it means truncation.
    End,
}

/// A part that could not be stored.
#[derive(Debug)]
pub struct FailedPart {
    /// Name the part declared.
    pub name: String,
    /// Why it failed.
    pub error: UploadError,
}

/// Result of one upload request.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    /// Canonical paths of stored files, in part order.
    pub uploaded: Vec<String>,
    /// Parts that failed.
    pub failed: Vec<FailedPart>,
}

/// Who is uploading.
#[derive(Debug, Clone)]
pub struct Uploader {
    /// Display name recorded in metadata.
    pub name: String,
    /// Network address recorded in metadata.
    pub ip: Option<String>,
}

struct PendingPart {
    declared: String,
    relative: String,
    task: JoinHandle<Result<u64, UploadError>>,
}

/// Streams uploads to disk and records their metadata.
pub struct UploadPipeline {
    resolver: Arc<PathResolver>,
    metadata: Arc<MetadataStore>,
    max_file_size: u64,
}

impl UploadPipeline {
    /// Create a pipeline enforcing `max_file_size` per part.
    pub fn new(resolver: Arc<PathResolver>, metadata: Arc<MetadataStore>, max_file_size: u64) -> Self {
        Self {
            resolver,
            metadata,
            max_file_size,
        }
    }

    /// Per-part size limit in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Upload every file part of `source` into the directory `dir`.
    ///
    /// Only a bad destination directory fails the whole request; anything
    /// that goes wrong afterwards is reported per part.
    pub async fn upload<S: PartSource>(
        &self,
        dir: &str,
        uploader: &Uploader,
        source: &mut S,
    ) -> Result<UploadOutcome, UploadError> {
        let base = self.resolver.resolve_dir(dir)?;
        fs::create_dir_all(&base.absolute).await?;

        let mut pending: Vec<PendingPart> = Vec::new();
        let mut outcome = UploadOutcome::default();

        loop {
            let declared = match source.next_part().await {
                Ok(Some(name)) => name,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Upload body ended abnormally");
                    outcome.failed.push(FailedPart {
                        name: String::new(),
                        error: e,
                    });
                    break;
                }
            };

            let (relative, absolute, file) = match self.claim_target(&base.relative, &declared).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(name = %declared, error = %e, "Rejected upload part");
                    outcome.failed.push(FailedPart { name: declared, error: e });
                    continue;
                }
            };
            debug!("Receiving {} into {:?}", declared, absolute);

            let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let task = tokio::spawn(write_part(
                file,
                absolute,
                relative.clone(),
                rx,
                self.max_file_size,
            ));
            pending.push(PendingPart {
                declared,
                relative,
                task,
            });

            // Keep draining after the writer stops so the body stays in sync.
            let mut writer_alive = true;
            let mut broken = false;
            loop {
                match source.next_chunk().await {
                    Ok(Some(bytes)) => {
                        if writer_alive && tx.send(Chunk::Data(bytes)).await.is_err() {
                            writer_alive = false;
                        }
                    }
                    Ok(None) => {
                        if writer_alive {
                            let _ = tx.send(Chunk::End).await;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Upload body ended mid-part");
                        broken = true;
                        break;
                    }
                }
            }
            drop(tx);
            if broken {
                break;
            }
        }

        for part in pending {
            let result = match part.task.await {
                Ok(result) => result,
                Err(e) => Err(UploadError::Io(std::io::Error::other(e.to_string()))),
            };
            match result {
                Ok(size) => {
                    let meta = FileMetadata::temporary(
                        uploader.name.clone(),
                        uploader.ip.clone(),
                        Utc::now(),
                    );
                    // The file is on disk either way; without a record it
                    // is treated as temporary and expires on schedule.
                    if let Err(e) = self.metadata.insert(part.relative.clone(), meta) {
                        warn!(path = %part.relative, error = %e, "Failed to record upload metadata");
                    }
                    info!("Stored upload {} ({} bytes)", part.relative, size);
                    outcome.uploaded.push(part.relative);
                }
                Err(e) => {
                    warn!(path = %part.relative, error = %e, "Upload part failed");
                    outcome.failed.push(FailedPart {
                        name: part.declared,
                        error: e,
                    });
                }
            }
        }

        if !outcome.uploaded.is_empty() {
            if let Err(e) = self.metadata.save() {
                warn!(error = %e, "Failed to persist upload metadata");
            }
        }
        Ok(outcome)
    }

    /// Sanitize the declared name and exclusively create a free target file.
    async fn claim_target(
        &self,
        base: &str,
        declared: &str,
    ) -> Result<(String, PathBuf, File), UploadError> {
        let mut sanitized = sanitize_relative_path(declared);
        if sanitized.is_empty() {
            sanitized = format!("file-{}", Utc::now().timestamp_millis());
        }
        let (sub_dir, name) = match sanitized.rsplit_once('/') {
            Some((dir, name)) => (dir.to_string(), name.to_string()),
            None => (String::new(), sanitized),
        };

        let dir_relative = [base, sub_dir.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        let dir = self.resolver.resolve_dir(&dir_relative)?;
        fs::create_dir_all(&dir.absolute).await?;
        // Re-check now that the directories exist.
        self.resolver.ensure_contained(&dir.absolute)?;

        let (file_name, absolute, file) = create_unique(&dir.absolute, &name).await?;
        let relative = if dir.is_root() {
            file_name
        } else {
            format!("{}/{}", dir.relative, file_name)
        };
        Ok((relative, absolute, file))
    }
}

/// Split `name` into stem and extension the way `name-N.ext` expects.
///
/// A leading dot does not start an extension (`.env` has none).
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Exclusively create `name` in `dir`, or `name-1.ext`, `name-2.ext`, ...
///
/// `create_new` makes the claim atomic, so two parts never share a target.
pub async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(String, PathBuf, File)> {
    let (stem, ext) = split_extension(name);
    for counter in 0..MAX_NAME_ATTEMPTS {
        let candidate = if counter == 0 {
            name.to_string()
        } else {
            format!("{stem}-{counter}{ext}")
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((candidate, path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {name}"),
    ))
}

/// Writer task: copy chunks into `file`, removing it unless the part completes.
async fn write_part(
    mut file: File,
    path: PathBuf,
    relative: String,
    mut rx: mpsc::Receiver<Chunk>,
    limit: u64,
) -> Result<u64, UploadError> {
    let result = copy_chunks(&mut file, &mut rx, &relative, limit).await;
    drop(rx);
    drop(file);

    if result.is_err() {
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Removed partial upload {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial upload"),
        }
    }
    result
}

async fn copy_chunks(
    file: &mut File,
    rx: &mut mpsc::Receiver<Chunk>,
    relative: &str,
    limit: u64,
) -> Result<u64, UploadError> {
    let mut written: u64 = 0;
    loop {
        match rx.recv().await {
            Some(Chunk::Data(bytes)) => {
                written += bytes.len() as u64;
                if written > limit {
                    return Err(UploadError::SizeLimitExceeded { limit });
                }
                file.write_all(&bytes).await?;
            }
            Some(Chunk::End) => {
                file.flush().await?;
                return Ok(written);
            }
            None => return Err(UploadError::Truncated(relative.to_string())),
        }
    }
}

/// Decode a declared file name that arrived percent-encoded.
///
/// Names without an escape sequence, or whose decoding is not UTF-8, are
/// returned unchanged.
pub fn decode_file_name(raw: &str) -> String {
    let has_escape = raw
        .as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit());
    if !has_escape {
        return raw.to_string();
    }
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// [`PartSource`] over a `multer` multipart body.
pub struct MultipartSource {
    multipart: multer::Multipart<'static>,
    current: Option<multer::Field<'static>>,
}

impl MultipartSource {
    /// Wrap a multipart body.
    pub fn new(multipart: multer::Multipart<'static>) -> Self {
        Self {
            multipart,
            current: None,
        }
    }
}

impl PartSource for MultipartSource {
    async fn next_part(&mut self) -> Result<Option<String>, UploadError> {
        self.current = None;
        while let Some(field) = self
            .multipart
            .next_field()
            .await
            .map_err(|e| UploadError::Multipart(e.to_string()))?
        {
            let Some(name) = field.file_name().map(decode_file_name) else {
                debug!("Ignoring non-file form field {:?}", field.name());
                continue;
            };
            self.current = Some(field);
            return Ok(Some(name));
        }
        Ok(None)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, UploadError> {
        match self.current.as_mut() {
            Some(field) => field
                .chunk()
                .await
                .map_err(|e| UploadError::Multipart(e.to_string())),
            None => Ok(None),
        }
    }
}
