//! The sandboxed shared folder.
//!
//! This module provides the file side of the service:
//! - Path resolution and name sanitizing against the storage root
//! - Per-file metadata with temporary/permanent lifecycle
//! - Streamed multipart uploads
//! - The background expiry sweep
//! - Directory listing and the mutating folder operations
//!
//! # Security
//!
//! Every client path goes through [`PathResolver`]. Paths are canonicalized
//! before they touch the disk and symlinks whose real location leaves the
//! root are rejected or hidden.

pub mod browser;
pub mod folder;
pub mod metadata;
pub mod resolver;
pub mod sweeper;
pub mod upload;

pub use browser::DirectoryBrowser;
pub use folder::{FileDownload, FolderError, SharedFolder};
pub use metadata::{FileMetadata, MetadataStore};
pub use resolver::{sanitize_name, sanitize_relative_path, PathResolver, ResolveError, ResolvedPath};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use upload::{MultipartSource, PartSource, UploadError, UploadOutcome, UploadPipeline, Uploader};
