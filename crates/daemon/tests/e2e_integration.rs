//! End-to-end integration tests for LanShare.
//!
//! These tests drive the HTTP router the way a browser client would:
//! - Listing, folder creation, rename and move
//! - Multipart uploads with colliding names
//! - Two-phase folder downloads
//! - Admin-only operations and the audit log

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use lanshare_daemon::archive::ArchiveService;
use lanshare_daemon::audit::AuditLog;
use lanshare_daemon::config::Config;
use lanshare_daemon::files::{MetadataStore, PathResolver, SharedFolder};
use lanshare_daemon::identity::StaticIdentities;
use lanshare_daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use lanshare_daemon::router::{build_router, AppState};
use lanshare_daemon::server_log::ServerLogBuffer;
use protocol::messages::{
    decode_reply, ArchiveTicket, AuditLines, EntryChanged, Listing, Relocated, ServerInfo,
    ServerLogEntry, ServerLogLevel, ServerLogs, StorageType, UploadSummary,
};
use protocol::{ErrorCode, ProtocolError};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "lanshare-test-boundary";

struct TestServer {
    router: Router,
    root: TempDir,
    server_logs: Arc<ServerLogBuffer>,
    _data: TempDir,
}

fn test_server() -> TestServer {
    let root = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    let resolver = Arc::new(PathResolver::new(root.path()).unwrap());
    let metadata = Arc::new(MetadataStore::new(data.path().join("metadata.json")));
    let audit = Arc::new(AuditLog::new(data.path().join("audit.log")));
    let folder = Arc::new(SharedFolder::new(
        Arc::clone(&resolver),
        metadata,
        audit,
        Duration::from_secs(3600),
        1024 * 1024,
    ));
    let archives = Arc::new(
        ArchiveService::new(
            resolver,
            data.path().join("tmp"),
            Duration::from_secs(60),
            ArchiveService::default_strategies(false),
        )
        .unwrap(),
    );

    let mut names = HashMap::new();
    names.insert("10.0.0.7".to_string(), "bob".to_string());
    let server_logs = Arc::new(ServerLogBuffer::new(4));
    let state = Arc::new(AppState {
        folder,
        archives,
        identities: Arc::new(StaticIdentities::new(&names, "guest")),
        host_address: "192.168.1.10".to_string(),
        port: 9999,
        trust_forwarded: false,
        server_logs: Arc::clone(&server_logs),
    });

    TestServer {
        router: build_router(state),
        root,
        server_logs,
        _data: data,
    }
}

fn from_peer(mut request: Request<Body>, ip: &str) -> Request<Body> {
    let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn admin(request: Request<Body>) -> Request<Body> {
    from_peer(request, "127.0.0.1")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart(uri: &str, files: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, content) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn call<T: serde::de::DeserializeOwned>(
    router: &Router,
    request: Request<Body>,
) -> Result<T, ProtocolError> {
    let (_, bytes) = send(router, request).await;
    decode_reply(&bytes)
}

fn remote_code(err: ProtocolError) -> ErrorCode {
    match err {
        ProtocolError::Remote { code, .. } => code,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

// =============================================================================
// Listing and Folder Operations
// =============================================================================

#[tokio::test]
async fn test_health_and_server_info() {
    let server = test_server();

    let (status, _) = send(&server.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);

    let info: ServerInfo = call(&server.router, from_peer(get("/api/server-info"), "10.0.0.7"))
        .await
        .unwrap();
    assert_eq!(info.client_ip, "10.0.0.7");
    assert_eq!(info.client_name, "bob");
    assert!(!info.is_admin);
    assert_eq!(info.port, 9999);

    let info: ServerInfo = call(&server.router, from_peer(get("/api/server-info"), "192.168.1.10"))
        .await
        .unwrap();
    assert!(info.is_admin);
    assert_eq!(info.client_name, "guest");
}

#[tokio::test]
async fn test_list_orders_folders_first() {
    let server = test_server();
    std::fs::write(server.root.path().join("a.txt"), b"a").unwrap();
    std::fs::create_dir(server.root.path().join("zeta")).unwrap();

    let listing: Listing = call(&server.router, get("/api/files")).await.unwrap();
    assert_eq!(listing.path, "");
    let names: Vec<_> = listing.files.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "a.txt"]);
    assert_eq!(listing.files[0].storage_type, StorageType::Folder);
}

#[tokio::test]
async fn test_list_stays_inside_root() {
    let server = test_server();

    // Leading parent hops are stripped, so the path lands inside the root.
    let listing: Listing = call(&server.router, get("/api/files?path=../../etc"))
        .await
        .unwrap();
    assert_eq!(listing.path, "etc");
    assert!(server.root.path().join("etc").is_dir());

    let err = call::<Listing>(&server.router, get("/api/files?path=a%00b"))
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::IllegalPath);

    // Listing a missing folder creates it.
    let listing: Listing = call(&server.router, get("/api/files?path=missing"))
        .await
        .unwrap();
    assert_eq!(listing.path, "missing");
    assert!(listing.files.is_empty());
    assert!(server.root.path().join("missing").is_dir());
}

#[tokio::test]
async fn test_mkdir_rename_and_move() {
    let server = test_server();

    let created: EntryChanged = call(
        &server.router,
        post_json("/api/folders", json!({ "path": "", "name": "docs" })),
    )
    .await
    .unwrap();
    assert_eq!(created.path, "docs");
    assert!(server.root.path().join("docs").is_dir());

    // Creating it again is not an error.
    let again: EntryChanged = call(
        &server.router,
        post_json("/api/folders", json!({ "path": "", "name": "docs" })),
    )
    .await
    .unwrap();
    assert_eq!(again.path, "docs");

    std::fs::write(server.root.path().join("notes.txt"), b"hello").unwrap();
    let renamed: Relocated = call(
        &server.router,
        post_json("/api/rename", json!({ "path": "notes.txt", "newName": "todo.txt" })),
    )
    .await
    .unwrap();
    assert_eq!(renamed.old_path, "notes.txt");
    assert_eq!(renamed.new_path, "todo.txt");

    let moved: Relocated = call(
        &server.router,
        post_json("/api/move", json!({ "path": "todo.txt", "targetFolderPath": "docs" })),
    )
    .await
    .unwrap();
    assert_eq!(moved.new_path, "docs/todo.txt");
    assert_eq!(
        std::fs::read(server.root.path().join("docs/todo.txt")).unwrap(),
        b"hello"
    );
}

#[tokio::test]
async fn test_move_conflicts_and_cycles() {
    let server = test_server();
    std::fs::create_dir_all(server.root.path().join("a/b")).unwrap();
    std::fs::write(server.root.path().join("x.txt"), b"1").unwrap();
    std::fs::write(server.root.path().join("a/x.txt"), b"2").unwrap();

    let err = call::<Relocated>(
        &server.router,
        post_json("/api/move", json!({ "path": "x.txt", "targetFolderPath": "a" })),
    )
    .await
    .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::Conflict);

    let err = call::<Relocated>(
        &server.router,
        post_json("/api/move", json!({ "path": "a", "targetFolderPath": "a/b" })),
    )
    .await
    .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidRequest);

    // Both files are untouched.
    assert_eq!(std::fs::read(server.root.path().join("x.txt")).unwrap(), b"1");
    assert_eq!(std::fs::read(server.root.path().join("a/x.txt")).unwrap(), b"2");
}

#[tokio::test]
async fn test_malformed_json_is_invalid_request() {
    let server = test_server();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/folders")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, bytes) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err = decode_reply::<EntryChanged>(&bytes).unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidRequest);
}

// =============================================================================
// Upload Tests
// =============================================================================

#[tokio::test]
async fn test_upload_renames_duplicates() {
    let server = test_server();
    std::fs::write(server.root.path().join("report.txt"), b"existing").unwrap();

    let summary: UploadSummary = call(
        &server.router,
        from_peer(
            multipart(
                "/api/upload?uploader=alice",
                &[("report.txt", b"first"), ("report.txt", b"second")],
            ),
            "10.0.0.7",
        ),
    )
    .await
    .unwrap();

    assert_eq!(summary.uploaded_count, 2);
    assert_eq!(summary.uploaded, vec!["report-1.txt", "report-2.txt"]);
    assert!(summary.failed.is_empty());
    assert_eq!(
        std::fs::read(server.root.path().join("report.txt")).unwrap(),
        b"existing"
    );
    assert_eq!(
        std::fs::read(server.root.path().join("report-2.txt")).unwrap(),
        b"second"
    );

    let listing: Listing = call(&server.router, get("/api/files")).await.unwrap();
    let entry = listing
        .files
        .iter()
        .find(|e| e.name == "report-1.txt")
        .unwrap();
    assert_eq!(entry.uploader, "alice");
    assert_eq!(entry.uploader_ip.as_deref(), Some("10.0.0.7"));
    assert_eq!(entry.storage_type, StorageType::Temporary);
    assert!(entry.expires_at.is_some());
}

#[tokio::test]
async fn test_upload_sanitizes_names_into_subfolder() {
    let server = test_server();
    std::fs::create_dir(server.root.path().join("inbox")).unwrap();

    let summary: UploadSummary = call(
        &server.router,
        multipart("/api/upload?path=inbox", &[("a:b.txt", b"data")]),
    )
    .await
    .unwrap();
    assert_eq!(summary.uploaded, vec!["inbox/a_b.txt"]);
}

#[tokio::test]
async fn test_upload_without_multipart_body() {
    let server = test_server();
    let err = call::<UploadSummary>(&server.router, post_json("/api/upload", json!({})))
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidRequest);
}

// =============================================================================
// Download Tests
// =============================================================================

#[tokio::test]
async fn test_download_file_by_path() {
    let server = test_server();
    std::fs::write(server.root.path().join("hello.txt"), b"hello world").unwrap();

    let response = server
        .router
        .clone()
        .oneshot(get("/api/download?path=hello.txt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("filename=\"hello.txt\""));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello world");
}

#[tokio::test]
async fn test_zip_token_is_single_use() {
    let server = test_server();
    std::fs::create_dir_all(server.root.path().join("photos/2024")).unwrap();
    std::fs::write(server.root.path().join("photos/a.jpg"), b"jpeg").unwrap();
    std::fs::write(server.root.path().join("photos/2024/b.jpg"), b"more").unwrap();

    let ticket: ArchiveTicket = call(
        &server.router,
        post_json("/api/zip", json!({ "path": "photos" })),
    )
    .await
    .unwrap();
    assert_eq!(ticket.zip_file_name, "photos.zip");
    assert_eq!(ticket.token.len(), 32);

    let uri = format!("/api/download?token={}", ticket.token);
    let (status, bytes) = send(&server.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert!(names.iter().any(|n| n.ends_with("a.jpg")));
    assert!(names.iter().any(|n| n.ends_with("2024/b.jpg")));

    let idx = names.iter().position(|n| n.ends_with("a.jpg")).unwrap();
    let mut content = String::new();
    archive
        .by_name(&names[idx])
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "jpeg");

    let err = call::<Value>(&server.router, get(&uri)).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::TokenNotFound);
}

#[tokio::test]
async fn test_zip_rejects_files_and_missing() {
    let server = test_server();
    std::fs::write(server.root.path().join("plain.txt"), b"x").unwrap();

    let err = call::<ArchiveTicket>(
        &server.router,
        post_json("/api/zip", json!({ "path": "plain.txt" })),
    )
    .await
    .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidRequest);

    let err = call::<ArchiveTicket>(
        &server.router,
        post_json("/api/zip", json!({ "path": "nope" })),
    )
    .await
    .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::NotFound);

    let (status, _) = send(&server.router, get("/api/download?token=deadbeef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Admin and Audit Tests
// =============================================================================

#[tokio::test]
async fn test_permanent_requires_admin() {
    let server = test_server();
    let summary: UploadSummary = call(
        &server.router,
        from_peer(multipart("/api/upload", &[("keep.bin", b"k")]), "10.0.0.7"),
    )
    .await
    .unwrap();
    assert_eq!(summary.uploaded, vec!["keep.bin"]);

    let (status, bytes) = send(
        &server.router,
        from_peer(
            post_json("/api/files/permanent", json!({ "path": "keep.bin" })),
            "10.0.0.7",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let err = decode_reply::<Value>(&bytes).unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::Forbidden);

    let (status, _) = send(
        &server.router,
        admin(post_json("/api/files/permanent", json!({ "path": "keep.bin" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let listing: Listing = call(&server.router, get("/api/files")).await.unwrap();
    let entry = listing.files.iter().find(|e| e.name == "keep.bin").unwrap();
    assert_eq!(entry.storage_type, StorageType::Permanent);
    assert!(entry.expires_at.is_none());
}

#[tokio::test]
async fn test_delete_and_audit_log() {
    let server = test_server();
    std::fs::write(server.root.path().join("old.txt"), b"x").unwrap();

    let deleted: EntryChanged = call(
        &server.router,
        from_peer(
            Request::builder()
                .method(Method::DELETE)
                .uri("/api/files?path=old.txt")
                .body(Body::empty())
                .unwrap(),
            "10.0.0.7",
        ),
    )
    .await
    .unwrap();
    assert_eq!(deleted.path, "old.txt");
    assert!(!server.root.path().join("old.txt").exists());

    let logs: AuditLines = call(&server.router, get("/api/logs?limit=5")).await.unwrap();
    assert_eq!(logs.lines.len(), 1);
    let line = &logs.lines[0];
    assert!(line.contains(" | delete | 10.0.0.7 | bob | old.txt"));
}

#[tokio::test]
async fn test_server_logs_newest_first() {
    let server = test_server();
    let levels = [
        ServerLogLevel::Info,
        ServerLogLevel::Warn,
        ServerLogLevel::Info,
        ServerLogLevel::Error,
        ServerLogLevel::Info,
        ServerLogLevel::Warn,
    ];
    for (i, level) in levels.into_iter().enumerate() {
        server.server_logs.push(ServerLogEntry {
            ts: chrono::Utc::now(),
            level,
            msg: format!("event {i}"),
        });
    }

    let logs: ServerLogs = call(&server.router, get("/api/server-logs")).await.unwrap();
    assert_eq!(logs.total, 4);
    let msgs: Vec<&str> = logs.entries.iter().map(|e| e.msg.as_str()).collect();
    assert_eq!(msgs, vec!["event 5", "event 4", "event 3", "event 2"]);
    assert_eq!(logs.entries[0].level, ServerLogLevel::Warn);

    let logs: ServerLogs = call(&server.router, get("/api/server-logs?limit=0"))
        .await
        .unwrap();
    assert_eq!(logs.entries.len(), 1);
    assert_eq!(logs.entries[0].msg, "event 5");
}

// =============================================================================
// Orchestrator Lifecycle Tests
// =============================================================================

fn create_test_config() -> (Config, TempDir, TempDir) {
    let data = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = data.path().to_path_buf();
    config.storage.root = root.path().to_path_buf();
    config.archive.external_tool = false;
    (config, data, root)
}

#[tokio::test]
async fn test_orchestrator_state_starts_stopped() {
    let (config, _data, _root) = create_test_config();
    let orchestrator = DaemonOrchestrator::new(config).unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}

#[tokio::test]
async fn test_orchestrator_start_stop() {
    let (config, _data, _root) = create_test_config();
    let orchestrator = DaemonOrchestrator::new(config).unwrap();

    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}
