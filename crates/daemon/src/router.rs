//! HTTP router dispatching API requests to the shared folder and archives.
//!
//! Every JSON response carries an `ok` flag. Failures are mapped onto the
//! wire [`ErrorCode`] and its HTTP status in one place, [`ApiError`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use protocol::messages::{
    ArchiveTicket, AuditLines, CreateFolderRequest, DownloadQuery, EntryChanged, EntryRequest,
    Health, Listing, LogsQuery, MoveRequest, PathQuery, Relocated, RenameRequest, Reply,
    ServerInfo, ServerLogs, Upgraded, UploadFailure, UploadQuery, UploadSummary,
};
use protocol::{ErrorBody, ErrorCode};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::archive::{ArchiveDownload, ArchiveError, ArchiveService};
use crate::audit::AuditError;
use crate::files::{FileDownload, FolderError, MultipartSource, SharedFolder, UploadError, Uploader};
use crate::identity::{is_admin, normalize_ip, Actor, IdentityResolver};
use crate::server_log::ServerLogBuffer;

/// Characters left unescaped in an RFC 5987 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Header naming the uploader when the query does not.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state behind every handler.
pub struct AppState {
    /// File operations.
    pub folder: Arc<SharedFolder>,
    /// Directory archives.
    pub archives: Arc<ArchiveService>,
    /// Caller display names.
    pub identities: Arc<dyn IdentityResolver>,
    /// Admin address.
    pub host_address: String,
    /// Advertised port.
    pub port: u16,
    /// Whether `X-Forwarded-For` names the caller.
    pub trust_forwarded: bool,
    /// Recent daemon log events.
    pub server_logs: Arc<ServerLogBuffer>,
}

/// An API failure, rendered as an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    /// Create an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// The wire error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = %self.code, "Request failed: {}", self.message);
        } else {
            debug!(code = %self.code, "Request rejected: {}", self.message);
        }
        (status, Json(ErrorBody::new(self.code, self.message))).into_response()
    }
}

impl From<FolderError> for ApiError {
    fn from(err: FolderError) -> Self {
        let code = match &err {
            FolderError::IllegalPath(_) => ErrorCode::IllegalPath,
            FolderError::InvalidName(_) | FolderError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            FolderError::NotFound(_) => ErrorCode::NotFound,
            FolderError::Conflict(_) => ErrorCode::Conflict,
            FolderError::Forbidden(_) => ErrorCode::Forbidden,
            FolderError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            FolderError::Io(_) | FolderError::Internal(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

/// Wire code for an upload failure.
pub fn upload_error_code(err: &UploadError) -> ErrorCode {
    match err {
        UploadError::IllegalPath(_) => ErrorCode::IllegalPath,
        UploadError::SizeLimitExceeded { .. } => ErrorCode::SizeLimitExceeded,
        UploadError::Truncated(_) | UploadError::Multipart(_) => ErrorCode::InvalidRequest,
        UploadError::Io(_) => ErrorCode::InternalError,
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        Self::new(upload_error_code(&err), err.to_string())
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        let code = match &err {
            ArchiveError::IllegalPath(_) => ErrorCode::IllegalPath,
            ArchiveError::NotFound(_) => ErrorCode::NotFound,
            ArchiveError::NotADirectory(_) => ErrorCode::InvalidRequest,
            ArchiveError::Pack(_) | ArchiveError::Invalid(_) | ArchiveError::Failed(_) => {
                ErrorCode::ArchiveFailure
            }
            ArchiveError::TokenNotFound => ErrorCode::TokenNotFound,
            ArchiveError::TokenExpired => ErrorCode::TokenExpired,
            ArchiveError::Io(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<Json<Reply<T>>, ApiError>;

fn reply<T>(body: T) -> ApiResult<T> {
    Ok(Json(Reply::ok(body)))
}

/// Who sent the request.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Normalized address and display name.
    pub actor: Actor,
    /// Whether the caller is the host.
    pub is_admin: bool,
    /// Value of the `x-user-id` header.
    pub user_id: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let forwarded = state
            .trust_forwarded
            .then(|| {
                parts
                    .headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
            .flatten();
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let ip = normalize_ip(&forwarded.or(peer).unwrap_or_else(|| "unknown".to_string()));

        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Caller {
            is_admin: is_admin(&ip, &state.host_address),
            actor: Actor::new(ip.clone(), state.identities.display_name(&ip)),
            user_id,
        })
    }
}

/// Build the API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/server-info", get(server_info))
        .route("/api/files", get(list_files).delete(delete_entry))
        .route("/api/folders", post(create_folder))
        .route("/api/rename", post(rename_entry))
        .route("/api/move", post(move_entry))
        .route("/api/files/permanent", post(make_permanent))
        .route(
            "/api/upload",
            post(upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/zip", post(prepare_archive))
        .route("/api/download", get(download))
        .route("/api/logs", get(read_logs))
        .route("/api/server-logs", get(read_server_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> ApiResult<Health> {
    reply(Health { now: Utc::now() })
}

async fn server_info(State(state): State<Arc<AppState>>, caller: Caller) -> ApiResult<ServerInfo> {
    reply(ServerInfo {
        host_address: state.host_address.clone(),
        port: state.port,
        client_ip: caller.actor.ip,
        client_name: caller.actor.name,
        is_admin: caller.is_admin,
    })
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Listing> {
    let path = query.path.unwrap_or_default();
    reply(state.folder.list(&path).await?)
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<CreateFolderRequest>, JsonRejection>,
) -> ApiResult<EntryChanged> {
    let Json(request) = payload?;
    reply(state.folder.mkdir(&request.path, &request.name, &caller.actor).await?)
}

async fn delete_entry(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(query): Query<PathQuery>,
) -> ApiResult<EntryChanged> {
    let path = query
        .path
        .ok_or_else(|| ApiError::invalid_request("missing path"))?;
    reply(state.folder.delete(&path, &caller.actor).await?)
}

async fn rename_entry(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> ApiResult<Relocated> {
    let Json(request) = payload?;
    reply(
        state
            .folder
            .rename(&request.path, &request.new_name, &caller.actor)
            .await?,
    )
}

async fn move_entry(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> ApiResult<Relocated> {
    let Json(request) = payload?;
    reply(
        state
            .folder
            .move_entry(&request.path, &request.target_folder_path, &caller.actor)
            .await?,
    )
}

async fn make_permanent(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<EntryRequest>, JsonRejection>,
) -> ApiResult<Upgraded> {
    let Json(request) = payload?;
    reply(
        state
            .folder
            .upgrade_permanent(&request.path, &caller.actor, caller.is_admin)
            .await?,
    )
}

async fn upload_files(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> ApiResult<UploadSummary> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::invalid_request("missing content type"))?;
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| ApiError::invalid_request(format!("not a multipart body: {e}")))?;

    let name = query
        .uploader
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .or(caller.user_id)
        .unwrap_or_else(|| caller.actor.name.clone());
    let uploader = Uploader {
        name,
        ip: Some(caller.actor.ip.clone()),
    };

    let multipart = multer::Multipart::new(request.into_body().into_data_stream(), boundary);
    let mut source = MultipartSource::new(multipart);
    let dir = query.path.unwrap_or_default();
    let outcome = state
        .folder
        .upload(&dir, &uploader, &caller.actor, &mut source)
        .await?;

    let failed = outcome
        .failed
        .iter()
        .map(|part| UploadFailure {
            name: part.name.clone(),
            code: upload_error_code(&part.error),
            message: part.error.to_string(),
        })
        .collect();
    reply(UploadSummary {
        uploaded_count: outcome.uploaded.len(),
        uploaded: outcome.uploaded,
        failed,
    })
}

async fn prepare_archive(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EntryRequest>, JsonRejection>,
) -> ApiResult<ArchiveTicket> {
    let Json(request) = payload?;
    reply(state.archives.prepare(&request.path, Utc::now()).await?)
}

async fn download(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    if let Some(token) = query.token.filter(|t| !t.is_empty()) {
        let archive = state.archives.fetch(&token, Utc::now()).await?;
        return archive_response(archive);
    }

    let path = query
        .path
        .ok_or_else(|| ApiError::invalid_request("missing token or path"))?;
    match state.folder.open_file(&path, &caller.actor).await? {
        FileDownload::File { file, len, name } => file_response(file, len, &name),
        FileDownload::Directory(dir) => {
            let archive = state.archives.archive_inline(&dir.relative).await?;
            archive_response(archive)
        }
    }
}

async fn read_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<AuditLines> {
    let lines = state.folder.audit().read_recent(query.limit).await?;
    reply(AuditLines { lines })
}

async fn read_server_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<ServerLogs> {
    let (entries, total) = state.server_logs.recent(query.limit);
    reply(ServerLogs { entries, total })
}

/// `Content-Disposition` with an ASCII fallback and the RFC 5987 UTF-8 name.
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(file_name, ATTR_CHAR)
    )
}

fn stream_response(
    body: Body,
    len: u64,
    content_type: &'static str,
    file_name: &str,
) -> Result<Response, ApiError> {
    let disposition = HeaderValue::from_str(&content_disposition(file_name))
        .map_err(|e| ApiError::new(ErrorCode::InternalError, e.to_string()))?;

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

fn file_response(file: File, len: u64, name: &str) -> Result<Response, ApiError> {
    let body = Body::from_stream(ReaderStream::new(file));
    stream_response(body, len, "application/octet-stream", name)
}

/// Stream an archive; its guard lives as long as the body does.
fn archive_response(archive: ArchiveDownload) -> Result<Response, ApiError> {
    let ArchiveDownload {
        file,
        len,
        display_name,
        guard,
    } = archive;
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &guard;
        chunk
    });
    stream_response(Body::from_stream(stream), len, "application/zip", &display_name)
}
