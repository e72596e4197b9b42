//! On-demand directory archives.
//!
//! Directory downloads are two-phase: a prepare call packs the directory
//! into a scratch zip and hands out an opaque token, and a fetch call
//! streams the archive for that token. Both the token and the scratch file
//! are removed once the download ends, or by the token sweep once the token
//! expires.
//!
//! # Scratch files
//!
//! Archives live in `<data_dir>/tmp` as `lanshare_<random>.zip`. Anything
//! matching that pattern at startup was left behind by a previous process
//! and is purged.

pub mod service;
pub mod strategy;
pub mod tokens;

use thiserror::Error;

pub use service::{ArchiveDownload, ArchiveService, DownloadGuard};
pub use strategy::{
    validate_archive, ArchiveStrategy, ExternalZipStrategy, ZipLibraryStrategy, ZIP_SIGNATURES,
};
pub use tokens::{DownloadToken, TokenTable};

/// Errors from archive preparation and download.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The path escapes the storage root or is empty.
    #[error("illegal path: {0}")]
    IllegalPath(String),

    /// The directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A single strategy failed to write an archive.
    #[error("packing failed: {0}")]
    Pack(String),

    /// A written archive did not pass validation.
    #[error("invalid archive: {0}")]
    Invalid(String),

    /// Every strategy failed; carries each strategy's diagnostic.
    #[error("could not build archive: {0}")]
    Failed(String),

    /// The token is unknown or already redeemed.
    #[error("download token not found")]
    TokenNotFound,

    /// The token expired or its archive is gone.
    #[error("download token expired")]
    TokenExpired,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::files::ResolveError> for ArchiveError {
    fn from(err: crate::files::ResolveError) -> Self {
        use crate::files::ResolveError;
        match err {
            ResolveError::IllegalPath(p) | ResolveError::InvalidName(p) => ArchiveError::IllegalPath(p),
            ResolveError::Io(e) => ArchiveError::Io(e),
        }
    }
}
