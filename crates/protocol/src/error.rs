//! Error types for the protocol crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried by every failed API response.
///
/// The daemon maps each failure onto exactly one code; clients branch on the
/// code rather than on the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A path tried to escape the storage root.
    IllegalPath,
    /// Malformed request: empty or invalid names, impossible moves.
    InvalidRequest,
    /// The target entry does not exist.
    NotFound,
    /// The destination name is already taken.
    Conflict,
    /// An uploaded file exceeded the per-file size limit.
    SizeLimitExceeded,
    /// Every archive packing strategy failed.
    ArchiveFailure,
    /// The download token existed but has expired; prepare again.
    TokenExpired,
    /// The download token is unknown or already redeemed.
    TokenNotFound,
    /// The caller is not allowed to perform the operation.
    Forbidden,
    /// Server-side error.
    InternalError,
}

impl ErrorCode {
    /// HTTP status code used when this error terminates a request.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::IllegalPath | ErrorCode::InvalidRequest => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound | ErrorCode::TokenNotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::TokenExpired => 410,
            ErrorCode::SizeLimitExceeded => 413,
            ErrorCode::ArchiveFailure | ErrorCode::InternalError => 500,
        }
    }

    /// The serialized name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IllegalPath => "IllegalPath",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::SizeLimitExceeded => "SizeLimitExceeded",
            ErrorCode::ArchiveFailure => "ArchiveFailure",
            ErrorCode::TokenExpired => "TokenExpired",
            ErrorCode::TokenNotFound => "TokenNotFound",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The server answered with an error body.
    #[error("{code}: {message}")]
    Remote {
        /// Error code reported by the server.
        code: ErrorCode,
        /// Human-readable message reported by the server.
        message: String,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
