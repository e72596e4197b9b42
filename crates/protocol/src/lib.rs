//! # LanShare Protocol Library
//!
//! Wire types for the LanShare shared-folder service. Both the daemon and any
//! client (web UI, desktop shell, scripts) speak these JSON shapes.
//!
//! ## Overview
//!
//! - **Messages**: request bodies, query strings and response bodies for every
//!   API operation, plus the [`FileEntry`] listing record
//! - **Errors**: the [`ErrorCode`] taxonomy shared by server and client and
//!   the client-side [`ProtocolError`]
//!
//! Every JSON response carries an `ok` flag. Successful bodies are wrapped in
//! [`Reply`], failures are an [`ErrorBody`].
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{ArchiveTicket, Reply};
//!
//! let reply = Reply::ok(ArchiveTicket {
//!     token: "0123456789abcdef0123456789abcdef".to_string(),
//!     zip_file_name: "photos.zip".to_string(),
//! });
//! let json = serde_json::to_vec(&reply).unwrap();
//!
//! let ticket: ArchiveTicket = protocol::decode_reply(&json).unwrap();
//! assert_eq!(ticket.zip_file_name, "photos.zip");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: API message definitions
//! - [`error`]: Error codes and the client-side error type

pub mod error;
pub mod messages;

pub use error::{ErrorCode, ProtocolError, Result};
pub use messages::{decode_reply, EntryKind, ErrorBody, FileEntry, Reply, StorageType};
