//! Sandboxed path resolution.
//!
//! Every path a client sends is relative to the storage root. This module
//! canonicalizes those paths, joins them onto the root and re-derives the
//! relative form from the joined result, so nothing a client sends can
//! address a location outside the root.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Errors produced while resolving or sanitizing paths.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The path escapes the storage root, or addresses the root as an entry.
    #[error("illegal path: {0}")]
    IllegalPath(String),

    /// The name is empty or reduces to nothing after sanitizing.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// IO error while preparing or inspecting the root.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved path: the canonical relative form plus its location on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical relative path ("" for the root).
    pub relative: String,
    /// Absolute path under the storage root.
    pub absolute: PathBuf,
}

impl ResolvedPath {
    /// Whether this addresses the storage root itself.
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// Final path segment, or "" for the root.
    pub fn name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or("")
    }

    /// Canonical relative path of the parent directory.
    pub fn parent_relative(&self) -> &str {
        self.relative.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }
}

/// Resolves client paths against a fixed storage root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Canonical absolute storage root.
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver, creating the root directory if needed.
    ///
    /// The root is canonicalized once so containment checks compare real
    /// locations.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, ResolveError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        tracing::debug!("Storage root resolved to {:?}", root);
        Ok(Self { root })
    }

    /// The canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonicalize a client-supplied relative path without touching disk.
    ///
    /// NFC-normalizes, treats `\` as a separator, drops empty and `.`
    /// segments, and folds `..` into the preceding segment. A `..` with
    /// nothing left to fold is dropped, which strips leading parent hops.
    pub fn canonicalize_relative(raw: &str) -> String {
        let normalized: String = raw.nfc().collect::<String>().replace('\\', "/");
        let mut segments: Vec<&str> = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        segments.join("/")
    }

    /// Resolve a path that addresses an entry.
    ///
    /// Fails with [`ResolveError::IllegalPath`] if the input collapses to the
    /// root, since the root is not an entry.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath, ResolveError> {
        let resolved = self.resolve_dir(raw)?;
        if resolved.is_root() {
            return Err(ResolveError::IllegalPath(raw.to_string()));
        }
        Ok(resolved)
    }

    /// Resolve a path that addresses a container; the root is allowed.
    pub fn resolve_dir(&self, raw: &str) -> Result<ResolvedPath, ResolveError> {
        let relative = Self::canonicalize_relative(raw);
        if relative.contains('\0') {
            return Err(ResolveError::IllegalPath(raw.to_string()));
        }

        let absolute = self.root.join(&relative);
        let rederived = self.relative_of(&absolute)?;
        if rederived != relative {
            return Err(ResolveError::IllegalPath(raw.to_string()));
        }

        self.ensure_contained(&absolute)?;
        Ok(ResolvedPath { relative, absolute })
    }

    /// Re-derive the canonical relative path of an absolute location.
    pub fn relative_of(&self, absolute: &Path) -> Result<String, ResolveError> {
        let illegal = || ResolveError::IllegalPath(absolute.display().to_string());
        let stripped = absolute.strip_prefix(&self.root).map_err(|_| illegal())?;

        let mut segments = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(segment) => {
                    segments.push(segment.to_str().ok_or_else(illegal)?.to_string())
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(illegal())
                }
            }
        }
        Ok(segments.join("/"))
    }

    /// Check that the real location of `absolute` stays under the root.
    ///
    /// The nearest existing ancestor is canonicalized, so a symlink anywhere
    /// on the way is followed before comparing.
    pub fn ensure_contained(&self, absolute: &Path) -> Result<(), ResolveError> {
        let existing = absolute
            .ancestors()
            .find(|p| fs::symlink_metadata(p).is_ok())
            .unwrap_or(&self.root);

        let real = fs::canonicalize(existing)?;
        if !real.starts_with(&self.root) {
            tracing::warn!(path = %absolute.display(), real = %real.display(), "Path escapes storage root");
            return Err(ResolveError::IllegalPath(absolute.display().to_string()));
        }
        Ok(())
    }
}

/// Characters replaced with `_` in entry names.
fn is_illegal_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Device names that some filesystems refuse, matched case-insensitively.
fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    match stem.as_str() {
        "con" | "prn" | "aux" | "nul" => true,
        _ => {
            let bytes = stem.as_bytes();
            bytes.len() == 4
                && (stem.starts_with("com") || stem.starts_with("lpt"))
                && matches!(bytes[3], b'1'..=b'9')
        }
    }
}

/// Sanitize a single entry name supplied by a client.
///
/// Only the final `/`-separated segment is kept. Illegal and control
/// characters become `_`, trailing dots and spaces are trimmed, and reserved
/// device names get a leading underscore.
pub fn sanitize_name(raw: &str) -> Result<String, ResolveError> {
    let normalized: String = raw.nfc().collect();
    let base = normalized.rsplit('/').next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(ResolveError::InvalidName(raw.to_string()));
    }

    let replaced: String = base
        .chars()
        .map(|c| if is_illegal_char(c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return Err(ResolveError::InvalidName(raw.to_string()));
    }

    if is_reserved_name(trimmed) {
        Ok(format!("_{trimmed}"))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Sanitize a nested relative path declared by an upload part.
///
/// Every segment goes through [`sanitize_name`]; rejected segments are
/// dropped. The result may be empty.
pub fn sanitize_relative_path(raw: &str) -> String {
    let normalized: String = raw.nfc().collect::<String>().replace('\\', "/");
    normalized
        .split('/')
        .filter(|s| !s.is_empty())
        .filter_map(|s| sanitize_name(s).ok())
        .collect::<Vec<_>>()
        .join("/")
}
