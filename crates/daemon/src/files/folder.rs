//! The shared folder: every client-facing file operation in one place.
//!
//! [`SharedFolder`] ties the resolver, metadata store, upload pipeline and
//! expiry sweeper together and records each mutation in the audit log.
//! Filesystem changes happen first; metadata follows. Once the filesystem
//! has changed, a failure to persist metadata is logged rather than
//! reported, since the in-memory records already match the disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use protocol::messages::{EntryChanged, Listing, Relocated, Upgraded};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

use super::browser::DirectoryBrowser;
use super::metadata::MetadataStore;
use super::resolver::{sanitize_name, PathResolver, ResolveError, ResolvedPath};
use super::sweeper::ExpirySweeper;
use super::upload::{PartSource, UploadError, UploadOutcome, UploadPipeline, Uploader};
use crate::audit::{AuditAction, AuditLog};
use crate::identity::Actor;

/// Errors from shared folder operations.
#[derive(Debug, Error)]
pub enum FolderError {
    /// The path escapes the storage root or addresses the root as an entry.
    #[error("illegal path: {0}")]
    IllegalPath(String),

    /// The supplied name is empty or unusable.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The request is well formed but cannot be carried out.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The destination already exists.
    #[error("already exists: {0}")]
    Conflict(String),

    /// The caller is not allowed to do this.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata persistence failed.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ResolveError> for FolderError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::IllegalPath(p) => FolderError::IllegalPath(p),
            ResolveError::InvalidName(n) => FolderError::InvalidName(n),
            ResolveError::Io(e) => FolderError::Io(e),
        }
    }
}

/// What a path download resolved to.
pub enum FileDownload {
    /// A regular file, streamed as is.
    File {
        /// Open file.
        file: File,
        /// Size in bytes.
        len: u64,
        /// File name offered to the client.
        name: String,
    },
    /// A directory; the caller archives it.
    Directory(ResolvedPath),
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn kind_label(is_dir: bool) -> &'static str {
    if is_dir {
        "folder"
    } else {
        "file"
    }
}

/// Stat `path` without following a final symlink; `NotFound` maps to the
/// folder error carrying `relative`.
async fn stat_entry(path: &Path, relative: &str) -> Result<std::fs::Metadata, FolderError> {
    match fs::symlink_metadata(path).await {
        Ok(stat) => Ok(stat),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FolderError::NotFound(relative.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn exists(path: &Path) -> Result<bool, FolderError> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// The shared folder facade.
pub struct SharedFolder {
    resolver: Arc<PathResolver>,
    metadata: Arc<MetadataStore>,
    browser: DirectoryBrowser,
    sweeper: Arc<ExpirySweeper>,
    uploads: UploadPipeline,
    audit: Arc<AuditLog>,
}

impl SharedFolder {
    /// Wire up the folder. `ttl` is the lifetime of temporary uploads.
    pub fn new(
        resolver: Arc<PathResolver>,
        metadata: Arc<MetadataStore>,
        audit: Arc<AuditLog>,
        ttl: Duration,
        max_file_size: u64,
    ) -> Self {
        let sweeper = Arc::new(ExpirySweeper::new(resolver.clone(), metadata.clone(), ttl));
        let browser = DirectoryBrowser::new(resolver.clone(), metadata.clone(), sweeper.ttl());
        let uploads = UploadPipeline::new(resolver.clone(), metadata.clone(), max_file_size);
        Self {
            resolver,
            metadata,
            browser,
            sweeper,
            uploads,
            audit,
        }
    }

    /// The path resolver.
    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    /// The metadata store.
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    /// The expiry sweeper.
    pub fn sweeper(&self) -> &Arc<ExpirySweeper> {
        &self.sweeper
    }

    /// The audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Sweep before serving; a failed sweep never fails the request.
    async fn sweep_quietly(&self) {
        if let Err(e) = self.sweeper.sweep_now().await {
            warn!(error = %e, "Opportunistic expiry sweep failed");
        }
    }

    /// List a directory after sweeping expired files.
    pub async fn list(&self, raw: &str) -> Result<Listing, FolderError> {
        self.sweep_quietly().await;
        self.browser.list_directory(raw)
    }

    /// Create folder `name` inside `parent`. Creating an existing folder succeeds.
    pub async fn mkdir(&self, parent: &str, name: &str, actor: &Actor) -> Result<EntryChanged, FolderError> {
        let parent = self.resolver.resolve_dir(parent)?;
        let name = sanitize_name(name)?;
        let target = self.resolver.resolve(&join_relative(&parent.relative, &name))?;

        match fs::metadata(&target.absolute).await {
            Ok(stat) if stat.is_dir() => {
                debug!("Folder {} already exists", target.relative);
                return Ok(EntryChanged {
                    path: target.relative,
                });
            }
            Ok(_) => return Err(FolderError::Conflict(target.relative)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::create_dir_all(&target.absolute).await?;
        info!("Created folder {}", target.relative);
        self.audit
            .record(AuditAction::Mkdir, actor, &target.relative, "")
            .await;
        Ok(EntryChanged {
            path: target.relative,
        })
    }

    /// Delete a file or a folder tree along with its metadata.
    pub async fn delete(&self, raw: &str, actor: &Actor) -> Result<EntryChanged, FolderError> {
        let target = self.resolver.resolve(raw)?;
        let stat = stat_entry(&target.absolute, &target.relative).await?;

        if stat.is_dir() {
            fs::remove_dir_all(&target.absolute).await?;
        } else {
            fs::remove_file(&target.absolute).await?;
        }

        let removed = match self.metadata.delete_tree(&target.relative) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(path = %target.relative, error = %e, "Failed to drop metadata");
                0
            }
        };
        if removed > 0 {
            self.persist_metadata();
        }
        info!("Deleted {} ({} metadata entries)", target.relative, removed);
        self.audit
            .record(AuditAction::Delete, actor, &target.relative, kind_label(stat.is_dir()))
            .await;
        Ok(EntryChanged {
            path: target.relative,
        })
    }

    fn persist_metadata(&self) {
        if let Err(e) = self.metadata.save() {
            warn!(error = %e, "Failed to persist metadata");
        }
    }

    /// Rename an entry in place. Renaming to the current name is a no-op.
    pub async fn rename(&self, raw: &str, new_name: &str, actor: &Actor) -> Result<Relocated, FolderError> {
        let source = self.resolver.resolve(raw)?;
        let name = sanitize_name(new_name)?;
        let stat = stat_entry(&source.absolute, &source.relative).await?;

        let dest = self
            .resolver
            .resolve(&join_relative(source.parent_relative(), &name))?;
        if dest.relative == source.relative {
            return Ok(Relocated {
                old_path: source.relative.clone(),
                new_path: source.relative,
            });
        }

        self.relocate(AuditAction::Rename, &source, &dest, &name, stat.is_dir(), actor)
            .await
    }

    /// Move an entry into `target_folder` (the root when empty).
    ///
    /// Moving into the current parent is a no-op. Moving a folder into itself
    /// or one of its descendants is rejected.
    pub async fn move_entry(
        &self,
        raw: &str,
        target_folder: &str,
        actor: &Actor,
    ) -> Result<Relocated, FolderError> {
        let source = self.resolver.resolve(raw)?;
        let folder = self.resolver.resolve_dir(target_folder)?;
        let stat = stat_entry(&source.absolute, &source.relative).await?;

        if folder.relative == source.relative
            || folder.relative.starts_with(&format!("{}/", source.relative))
        {
            return Err(FolderError::InvalidRequest(format!(
                "cannot move {} into itself",
                source.relative
            )));
        }
        if folder.relative == source.parent_relative() {
            return Ok(Relocated {
                old_path: source.relative.clone(),
                new_path: source.relative,
            });
        }

        match fs::metadata(&folder.absolute).await {
            Ok(dir) if dir.is_dir() => {}
            Ok(_) => {
                return Err(FolderError::InvalidRequest(format!(
                    "not a directory: {}",
                    folder.relative
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FolderError::NotFound(folder.relative))
            }
            Err(e) => return Err(e.into()),
        }

        let dest = self
            .resolver
            .resolve(&join_relative(&folder.relative, source.name()))?;
        let shown = if folder.is_root() { "/" } else { folder.relative.as_str() };
        self.relocate(AuditAction::Move, &source, &dest, shown, stat.is_dir(), actor)
            .await
    }

    async fn relocate(
        &self,
        action: AuditAction,
        source: &ResolvedPath,
        dest: &ResolvedPath,
        shown: &str,
        is_dir: bool,
        actor: &Actor,
    ) -> Result<Relocated, FolderError> {
        if exists(&dest.absolute).await? {
            return Err(FolderError::Conflict(dest.relative.clone()));
        }

        fs::rename(&source.absolute, &dest.absolute).await?;
        let moved = match self.metadata.rename_tree(&source.relative, &dest.relative) {
            Ok(moved) => moved,
            Err(e) => {
                warn!(path = %source.relative, error = %e, "Failed to move metadata");
                0
            }
        };
        if moved > 0 {
            self.persist_metadata();
        }
        info!(
            "{} {} -> {} ({} metadata entries)",
            action.as_str(),
            source.relative,
            dest.relative,
            moved
        );

        let detail = format!("{} -> {}", kind_label(is_dir), shown);
        self.audit.record(action, actor, &source.relative, &detail).await;
        Ok(Relocated {
            old_path: source.relative.clone(),
            new_path: dest.relative.clone(),
        })
    }

    /// Exempt a file from expiry. Only the admin may do this.
    pub async fn upgrade_permanent(
        &self,
        raw: &str,
        actor: &Actor,
        is_admin: bool,
    ) -> Result<Upgraded, FolderError> {
        if !is_admin {
            return Err(FolderError::Forbidden(
                "only the host can make files permanent".to_string(),
            ));
        }

        let target = self.resolver.resolve(raw)?;
        let stat = match fs::metadata(&target.absolute).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FolderError::NotFound(target.relative))
            }
            Err(e) => return Err(e.into()),
        };
        if !stat.is_file() {
            return Err(FolderError::InvalidRequest(format!(
                "only files can be made permanent: {}",
                target.relative
            )));
        }

        let now = Utc::now();
        let modified: DateTime<Utc> = stat.modified().map(DateTime::from).unwrap_or(now);
        let meta = self.metadata.mark_permanent(&target.relative, modified, now)?;
        self.metadata.save()?;

        info!("Upgraded {} to permanent", target.relative);
        self.audit
            .record(AuditAction::Upgrade, actor, &target.relative, "permanent")
            .await;
        Ok(Upgraded {
            path: target.relative,
            upgraded_at: meta.upgraded_at.unwrap_or(now),
        })
    }

    /// Store every file part of `source` under `dir`.
    pub async fn upload<S: PartSource>(
        &self,
        dir: &str,
        uploader: &Uploader,
        actor: &Actor,
        source: &mut S,
    ) -> Result<UploadOutcome, UploadError> {
        let outcome = self.uploads.upload(dir, uploader, source).await?;
        for path in &outcome.uploaded {
            let detail = match fs::metadata(self.resolver.root().join(path)).await {
                Ok(stat) => format!("{} bytes", stat.len()),
                Err(_) => String::new(),
            };
            self.audit.record(AuditAction::Upload, actor, path, &detail).await;
        }
        Ok(outcome)
    }

    /// Open a file for download, after sweeping expired files.
    ///
    /// Directories are returned unopened so the caller can archive them.
    pub async fn open_file(&self, raw: &str, actor: &Actor) -> Result<FileDownload, FolderError> {
        self.sweep_quietly().await;

        let target = self.resolver.resolve(raw)?;
        let stat = match fs::metadata(&target.absolute).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FolderError::NotFound(target.relative))
            }
            Err(e) => return Err(e.into()),
        };

        self.audit
            .record(AuditAction::Download, actor, &target.relative, kind_label(stat.is_dir()))
            .await;

        if stat.is_dir() {
            return Ok(FileDownload::Directory(target));
        }
        if !stat.is_file() {
            return Err(FolderError::InvalidRequest(format!(
                "not a regular file: {}",
                target.relative
            )));
        }

        let file = File::open(&target.absolute).await?;
        Ok(FileDownload::File {
            file,
            len: stat.len(),
            name: target.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::metadata::FileMetadata;
    use crate::files::upload::tests::MemorySource;
    use protocol::messages::StorageType;
    use std::fs as sync_fs;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        folder: SharedFolder,
    }

    impl Fixture {
        fn root(&self) -> &Path {
            self.folder.resolver().root()
        }

        fn audit_text(&self) -> String {
            sync_fs::read_to_string(self.temp_dir.path().join("audit.log")).unwrap_or_default()
        }
    }

    fn fixture() -> Fixture {
        fixture_with_metadata("file_meta.json")
    }

    fn fixture_with_metadata(relative: &str) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let resolver = Arc::new(PathResolver::new(temp_dir.path().join("storage")).unwrap());
        let metadata = Arc::new(MetadataStore::new(temp_dir.path().join(relative)));
        let audit = Arc::new(AuditLog::new(temp_dir.path().join("audit.log")));
        let folder = SharedFolder::new(
            resolver,
            metadata,
            audit,
            Duration::from_secs(24 * 60 * 60),
            1024,
        );
        Fixture { temp_dir, folder }
    }

    fn actor() -> Actor {
        Actor::new("10.0.0.2", "alice")
    }

    fn uploader() -> Uploader {
        Uploader {
            name: "alice".to_string(),
            ip: Some("10.0.0.2".to_string()),
        }
    }

    fn track(f: &Fixture, key: &str, at: DateTime<Utc>) {
        f.folder
            .metadata()
            .insert(
                key.to_string(),
                FileMetadata::temporary("alice".into(), None, at),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_mkdir() {
        let f = fixture();
        let created = f.folder.mkdir("docs", "new:folder", &actor()).await.unwrap();
        assert_eq!(created.path, "docs/new_folder");
        assert!(f.root().join("docs/new_folder").is_dir());

        // Again is fine.
        f.folder.mkdir("docs", "new:folder", &actor()).await.unwrap();
        assert_eq!(f.audit_text().lines().count(), 1);
        assert!(f.audit_text().contains("| mkdir |"));
    }

    #[tokio::test]
    async fn test_mkdir_over_file_conflicts() {
        let f = fixture();
        sync_fs::write(f.root().join("taken"), "x").unwrap();
        let result = f.folder.mkdir("", "taken", &actor()).await;
        assert!(matches!(result, Err(FolderError::Conflict(_))));

        let result = f.folder.mkdir("", "..", &actor()).await;
        assert!(matches!(result, Err(FolderError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_delete_tree_and_metadata() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("a/b")).unwrap();
        sync_fs::write(f.root().join("a/b/x.txt"), "x").unwrap();
        sync_fs::write(f.root().join("ab.txt"), "y").unwrap();
        track(&f, "a/b/x.txt", Utc::now());
        track(&f, "ab.txt", Utc::now());

        f.folder.delete("a", &actor()).await.unwrap();
        assert!(!f.root().join("a").exists());
        assert!(f.folder.metadata().get("a/b/x.txt").unwrap().is_none());
        assert!(f.folder.metadata().get("ab.txt").unwrap().is_some());
        assert!(f.audit_text().contains("| delete |"));
    }

    #[tokio::test]
    async fn test_delete_missing_and_root() {
        let f = fixture();
        assert!(matches!(
            f.folder.delete("nope.txt", &actor()).await,
            Err(FolderError::NotFound(_))
        ));
        assert!(matches!(
            f.folder.delete("../", &actor()).await,
            Err(FolderError::IllegalPath(_))
        ));
        assert!(f.root().exists());
    }

    #[tokio::test]
    async fn test_mutations_survive_unwritable_metadata() {
        let f = fixture_with_metadata("blocked/file_meta.json");
        // A regular file where the snapshot directory should be.
        sync_fs::write(f.temp_dir.path().join("blocked"), "").unwrap();
        sync_fs::create_dir_all(f.root().join("a")).unwrap();
        sync_fs::write(f.root().join("a/x.txt"), "x").unwrap();
        sync_fs::write(f.root().join("gone.txt"), "y").unwrap();
        track(&f, "a/x.txt", Utc::now());
        track(&f, "gone.txt", Utc::now());

        f.folder.delete("gone.txt", &actor()).await.unwrap();
        assert!(!f.root().join("gone.txt").exists());
        assert!(f.folder.metadata().get("gone.txt").unwrap().is_none());

        let result = f.folder.rename("a", "b", &actor()).await.unwrap();
        assert_eq!(result.new_path, "b");
        assert!(f.folder.metadata().get("b/x.txt").unwrap().is_some());
        assert!(f.folder.metadata().get("a/x.txt").unwrap().is_none());

        assert!(!f.folder.metadata().path().exists());
        assert_eq!(f.audit_text().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_rename_folder_rewrites_metadata() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("a/b")).unwrap();
        sync_fs::write(f.root().join("a/b/x.txt"), "x").unwrap();
        track(&f, "a/b/x.txt", Utc::now());

        let result = f.folder.rename("a/b", "c", &actor()).await.unwrap();
        assert_eq!(result.old_path, "a/b");
        assert_eq!(result.new_path, "a/c");
        assert!(f.root().join("a/c/x.txt").is_file());
        assert!(f.folder.metadata().get("a/c/x.txt").unwrap().is_some());
        assert!(f.folder.metadata().get("a/b/x.txt").unwrap().is_none());
        assert!(f.audit_text().contains("folder -> c"));
    }

    #[tokio::test]
    async fn test_rename_same_name_and_conflict() {
        let f = fixture();
        sync_fs::write(f.root().join("one.txt"), "1").unwrap();
        sync_fs::write(f.root().join("two.txt"), "2").unwrap();

        let same = f.folder.rename("one.txt", "one.txt", &actor()).await.unwrap();
        assert_eq!(same.new_path, "one.txt");

        let result = f.folder.rename("one.txt", "two.txt", &actor()).await;
        assert!(matches!(result, Err(FolderError::Conflict(_))));
        assert_eq!(sync_fs::read_to_string(f.root().join("two.txt")).unwrap(), "2");
    }

    #[tokio::test]
    async fn test_move_conflict_leaves_everything() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("docs")).unwrap();
        sync_fs::create_dir_all(f.root().join("archive")).unwrap();
        sync_fs::write(f.root().join("docs/report.pdf"), "new").unwrap();
        sync_fs::write(f.root().join("archive/report.pdf"), "old").unwrap();
        track(&f, "docs/report.pdf", Utc::now());

        let result = f.folder.move_entry("docs/report.pdf", "archive", &actor()).await;
        assert!(matches!(result, Err(FolderError::Conflict(_))));
        assert!(f.root().join("docs/report.pdf").exists());
        assert!(f.folder.metadata().get("docs/report.pdf").unwrap().is_some());
        assert!(f.folder.metadata().get("archive/report.pdf").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_into_folder_and_root() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("docs")).unwrap();
        sync_fs::create_dir_all(f.root().join("archive")).unwrap();
        sync_fs::write(f.root().join("docs/report.pdf"), "r").unwrap();
        track(&f, "docs/report.pdf", Utc::now());

        let moved = f
            .folder
            .move_entry("docs/report.pdf", "archive", &actor())
            .await
            .unwrap();
        assert_eq!(moved.new_path, "archive/report.pdf");
        assert!(f.folder.metadata().get("archive/report.pdf").unwrap().is_some());

        let moved = f
            .folder
            .move_entry("archive/report.pdf", "", &actor())
            .await
            .unwrap();
        assert_eq!(moved.new_path, "report.pdf");
        assert!(f.root().join("report.pdf").is_file());
        assert!(f.audit_text().contains("file -> /"));
    }

    #[tokio::test]
    async fn test_move_into_itself_rejected() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("a/b")).unwrap();

        for target in ["a", "a/b"] {
            let result = f.folder.move_entry("a", target, &actor()).await;
            assert!(matches!(result, Err(FolderError::InvalidRequest(_))), "{target}");
        }
        // Onto the current parent is a no-op.
        let same = f.folder.move_entry("a/b", "a", &actor()).await.unwrap();
        assert_eq!(same.new_path, "a/b");
    }

    #[tokio::test]
    async fn test_move_to_missing_folder() {
        let f = fixture();
        sync_fs::write(f.root().join("x.txt"), "x").unwrap();
        let result = f.folder.move_entry("x.txt", "nowhere", &actor()).await;
        assert!(matches!(result, Err(FolderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upgrade_requires_admin() {
        let f = fixture();
        sync_fs::write(f.root().join("a.txt"), "a").unwrap();
        let result = f.folder.upgrade_permanent("a.txt", &actor(), false).await;
        assert!(matches!(result, Err(FolderError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_folders() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("dir")).unwrap();
        let result = f.folder.upgrade_permanent("dir", &actor(), true).await;
        assert!(matches!(result, Err(FolderError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_temporary_lifecycle_and_upgrade() {
        let f = fixture();
        let mut source = MemorySource::new(vec![
            ("keep.txt", vec![b"keep".as_slice()]),
            ("drop.txt", vec![b"drop".as_slice()]),
        ]);
        let outcome = f
            .folder
            .upload("", &uploader(), &actor(), &mut source)
            .await
            .unwrap();
        assert_eq!(outcome.uploaded.len(), 2);
        assert_eq!(f.audit_text().matches("| upload |").count(), 2);
        assert!(f.audit_text().contains("4 bytes"));

        let listing = f.folder.list("").await.unwrap();
        for entry in &listing.files {
            assert_eq!(entry.storage_type, StorageType::Temporary);
            let expected = entry.uploaded_at + chrono::Duration::hours(24);
            assert_eq!(entry.expires_at, Some(expected));
        }

        let upgraded = f
            .folder
            .upgrade_permanent("keep.txt", &actor(), true)
            .await
            .unwrap();
        assert_eq!(upgraded.path, "keep.txt");

        let later = Utc::now() + chrono::Duration::hours(25);
        let report = f.folder.sweeper().sweep(later).await.unwrap();
        assert_eq!(report.removed, vec!["drop.txt"]);
        assert!(!f.root().join("drop.txt").exists());
        assert!(f.root().join("keep.txt").exists());

        let listing = f.folder.list("").await.unwrap();
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].storage_type, StorageType::Permanent);
        assert_eq!(listing.files[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_upgrade_untracked_file_uses_mtime() {
        let f = fixture();
        sync_fs::write(f.root().join("old.txt"), "o").unwrap();
        let mtime: DateTime<Utc> = sync_fs::metadata(f.root().join("old.txt"))
            .unwrap()
            .modified()
            .unwrap()
            .into();

        f.folder
            .upgrade_permanent("old.txt", &actor(), true)
            .await
            .unwrap();
        let meta = f.folder.metadata().get("old.txt").unwrap().unwrap();
        assert!(meta.is_permanent);
        assert_eq!(meta.uploaded_at, mtime);
        assert!(meta.upgraded_at.is_some());
    }

    #[tokio::test]
    async fn test_open_file() {
        let f = fixture();
        sync_fs::create_dir_all(f.root().join("dir")).unwrap();
        sync_fs::write(f.root().join("dir/a.txt"), "hello").unwrap();

        match f.folder.open_file("dir/a.txt", &actor()).await.unwrap() {
            FileDownload::File { len, name, .. } => {
                assert_eq!(len, 5);
                assert_eq!(name, "a.txt");
            }
            FileDownload::Directory(_) => panic!("expected a file"),
        }
        match f.folder.open_file("dir", &actor()).await.unwrap() {
            FileDownload::Directory(resolved) => assert_eq!(resolved.relative, "dir"),
            FileDownload::File { .. } => panic!("expected a directory"),
        }
        assert!(matches!(
            f.folder.open_file("missing.txt", &actor()).await,
            Err(FolderError::NotFound(_))
        ));
        assert_eq!(f.audit_text().matches("| download |").count(), 2);
    }

    #[tokio::test]
    async fn test_open_file_sweeps_expired_first() {
        let f = fixture();
        sync_fs::write(f.root().join("stale.txt"), "s").unwrap();
        track(&f, "stale.txt", Utc::now() - chrono::Duration::hours(25));

        let result = f.folder.open_file("stale.txt", &actor()).await;
        assert!(matches!(result, Err(FolderError::NotFound(_))));
        assert!(f.folder.metadata().get("stale.txt").unwrap().is_none());
    }
}
