//! # LanShare Daemon Library
//!
//! This crate provides the server side of LanShare, a shared folder that
//! machines on the same network can browse, upload to and download from
//! through a plain HTTP API.
//!
//! ## Overview
//!
//! - **Sandboxed paths**: every client path is resolved against a single
//!   storage root and can never escape it
//! - **Temporary files**: uploads expire after a configurable TTL unless
//!   the admin marks them permanent
//! - **Folder archives**: folders are zipped into scratch space and handed
//!   out through short-lived download tokens
//! - **Audit trail**: every mutation is appended to a plain-text log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                  HTTP Router (axum)                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │    Shared    │  │   Archive    │  │      Audit Log       │  │
//! │  │    Folder    │  │   Service    │  │                      │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────┐ ┌───────────────┐ ┌───────────────────────┐ │
//! │  │ Path Resolver │ │ Metadata Store│ │ Expiry / Token Sweeps │ │
//! │  └───────────────┘ └───────────────┘ └───────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanshare_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!
//!     // Serves until the shutdown token is cancelled.
//!     orchestrator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Path resolution, metadata, uploads, expiry and folder operations
//! - [`archive`]: Folder archiving and download tokens
//! - [`audit`]: Append-only audit log
//! - [`identity`]: Caller names and admin detection
//! - [`router`]: HTTP routes
//! - [`server_log`]: Recent daemon log events for the API
//! - [`orchestrator`]: Main daemon coordinator
//! - [`pidfile`]: Running-daemon detection

pub mod archive;
pub mod audit;
pub mod config;
pub mod files;
pub mod identity;
pub mod orchestrator;
pub mod pidfile;
pub mod router;
pub mod server_log;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use files::{
    FileMetadata, FolderError, MetadataStore, PathResolver, ResolveError, ResolvedPath,
    SharedFolder, UploadError, UploadPipeline,
};

pub use archive::{ArchiveError, ArchiveService};

pub use audit::{AuditAction, AuditLog};

pub use identity::{Actor, IdentityResolver, StaticIdentities};

pub use router::{build_router, AppState};

pub use server_log::{ServerLogBuffer, ServerLogLayer};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
