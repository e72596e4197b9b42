//! Directory listing.
//!
//! Listings always re-stat the filesystem and merge in whatever metadata is
//! recorded, so a listing reflects the disk even when the metadata map lags.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use protocol::messages::{EntryKind, FileEntry, Listing, StorageType, UNKNOWN_UPLOADER};

use super::folder::FolderError;
use super::metadata::MetadataStore;
use super::resolver::PathResolver;

/// Lists directories under the storage root.
pub struct DirectoryBrowser {
    resolver: Arc<PathResolver>,
    metadata: Arc<MetadataStore>,
    ttl: chrono::Duration,
}

impl DirectoryBrowser {
    /// Create a browser.
    pub fn new(
        resolver: Arc<PathResolver>,
        metadata: Arc<MetadataStore>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            resolver,
            metadata,
            ttl,
        }
    }

    /// List a directory, creating it first if it does not exist.
    ///
    /// Folders come first, then files; each group is ordered by name.
    pub fn list_directory(&self, raw: &str) -> Result<Listing, FolderError> {
        let dir = self.resolver.resolve_dir(raw)?;

        match fs::metadata(&dir.absolute) {
            Ok(stat) if !stat.is_dir() => {
                return Err(FolderError::InvalidRequest(format!(
                    "not a directory: {}",
                    dir.relative
                )))
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir.absolute)?;
                tracing::debug!("Created missing directory {:?}", dir.absolute);
            }
            Err(e) => return Err(e.into()),
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir.absolute)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!("Skipping non UTF-8 entry in {:?}", dir.absolute);
                continue;
            };
            let relative = if dir.is_root() {
                name.clone()
            } else {
                format!("{}/{}", dir.relative, name)
            };
            if let Some(file_entry) = self.describe(name, relative, &entry.path())? {
                files.push(file_entry);
            }
        }

        files.sort_by(|a, b| {
            let a_is_dir = a.kind == EntryKind::Folder;
            let b_is_dir = b.kind == EntryKind::Folder;
            b_is_dir
                .cmp(&a_is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Listing {
            path: dir.relative,
            files,
        })
    }

    /// Build the listing record for one entry, or `None` if it should be hidden.
    fn describe(
        &self,
        name: String,
        relative: String,
        absolute: &Path,
    ) -> Result<Option<FileEntry>, FolderError> {
        let is_symlink = fs::symlink_metadata(absolute)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink && self.resolver.ensure_contained(absolute).is_err() {
            return Ok(None);
        }

        // Entries can vanish between readdir and stat.
        let stat = match fs::metadata(absolute) {
            Ok(stat) => stat,
            Err(_) => return Ok(None),
        };
        let modified_at: DateTime<Utc> = stat
            .modified()
            .map(DateTime::from)
            .unwrap_or_default();

        if stat.is_dir() {
            return Ok(Some(FileEntry {
                name,
                path: relative,
                kind: EntryKind::Folder,
                size: 0,
                modified_at,
                uploader: UNKNOWN_UPLOADER.to_string(),
                uploader_ip: None,
                uploaded_at: modified_at,
                expires_at: None,
                storage_type: StorageType::Folder,
            }));
        }
        if !stat.is_file() {
            return Ok(None);
        }

        let entry = match self.metadata.get(&relative)? {
            Some(meta) => FileEntry {
                name,
                path: relative,
                kind: EntryKind::File,
                size: stat.len(),
                modified_at,
                expires_at: meta.expires_at(self.ttl),
                storage_type: if meta.is_permanent {
                    StorageType::Permanent
                } else {
                    StorageType::Temporary
                },
                uploader: meta.uploader,
                uploader_ip: meta.uploader_ip,
                uploaded_at: meta.uploaded_at,
            },
            // Files nobody uploaded through the service are permanent.
            None => FileEntry {
                name,
                path: relative,
                kind: EntryKind::File,
                size: stat.len(),
                modified_at,
                uploader: UNKNOWN_UPLOADER.to_string(),
                uploader_ip: None,
                uploaded_at: modified_at,
                expires_at: None,
                storage_type: StorageType::Permanent,
            },
        };
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::metadata::FileMetadata;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn create_browser(temp_dir: &TempDir) -> (Arc<PathResolver>, Arc<MetadataStore>, DirectoryBrowser) {
        let resolver = Arc::new(PathResolver::new(temp_dir.path().join("storage")).unwrap());
        let metadata = Arc::new(MetadataStore::new(temp_dir.path().join("file_meta.json")));
        let browser =
            DirectoryBrowser::new(resolver.clone(), metadata.clone(), chrono::Duration::hours(24));
        (resolver, metadata, browser)
    }

    #[test]
    fn test_list_sorting() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);
        let root = resolver.root();
        fs::write(root.join("zebra.txt"), "z").unwrap();
        fs::write(root.join("Apple.txt"), "a").unwrap();
        fs::create_dir_all(root.join("beta_dir")).unwrap();
        fs::create_dir_all(root.join("alpha_dir")).unwrap();

        let listing = browser.list_directory("").unwrap();
        let names: Vec<&str> = listing.files.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha_dir", "beta_dir", "Apple.txt", "zebra.txt"]);
        assert_eq!(listing.path, "");
    }

    #[test]
    fn test_list_merges_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, metadata, browser) = create_browser(&temp_dir);
        fs::create_dir_all(resolver.root().join("docs")).unwrap();
        fs::write(resolver.root().join("docs/report.pdf"), "12345").unwrap();
        fs::write(resolver.root().join("docs/legacy.bin"), "x").unwrap();

        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        metadata
            .insert(
                "docs/report.pdf".to_string(),
                FileMetadata::temporary("alice".to_string(), Some("10.0.0.2".to_string()), t),
            )
            .unwrap();

        let listing = browser.list_directory("docs").unwrap();
        assert_eq!(listing.path, "docs");

        let report = listing.files.iter().find(|e| e.name == "report.pdf").unwrap();
        assert_eq!(report.path, "docs/report.pdf");
        assert_eq!(report.size, 5);
        assert_eq!(report.uploader, "alice");
        assert_eq!(report.storage_type, StorageType::Temporary);
        assert_eq!(report.expires_at, Some(t + chrono::Duration::hours(24)));

        let legacy = listing.files.iter().find(|e| e.name == "legacy.bin").unwrap();
        assert_eq!(legacy.storage_type, StorageType::Permanent);
        assert_eq!(legacy.uploader, UNKNOWN_UPLOADER);
        assert_eq!(legacy.uploaded_at, legacy.modified_at);
        assert!(legacy.expires_at.is_none());
    }

    #[test]
    fn test_list_creates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);

        let listing = browser.list_directory("new/nested").unwrap();
        assert!(listing.files.is_empty());
        assert!(resolver.root().join("new/nested").is_dir());
    }

    #[test]
    fn test_list_file_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);
        fs::write(resolver.root().join("file.txt"), "x").unwrap();

        let result = browser.list_directory("file.txt");
        assert!(matches!(result, Err(FolderError::InvalidRequest(_))));
    }

    #[test]
    fn test_list_traversal_stays_in_root() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);
        fs::write(resolver.root().join("inside.txt"), "x").unwrap();

        let listing = browser.list_directory("../../..").unwrap();
        assert_eq!(listing.path, "");
        assert_eq!(listing.files.len(), 1);
    }

    #[test]
    fn test_list_hides_escaping_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);
        let outside = temp_dir.path().join("outside.txt");
        fs::write(&outside, "secret").unwrap();
        std::os::unix::fs::symlink(&outside, resolver.root().join("sneaky")).unwrap();
        fs::write(resolver.root().join("visible.txt"), "x").unwrap();

        let listing = browser.list_directory("").unwrap();
        let names: Vec<&str> = listing.files.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["visible.txt"]);
    }

    #[test]
    fn test_list_escaping_symlink_dir_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _, browser) = create_browser(&temp_dir);
        let outside = temp_dir.path().join("outside_dir");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, resolver.root().join("escape")).unwrap();

        let result = browser.list_directory("escape");
        assert!(matches!(result, Err(FolderError::IllegalPath(_))));
    }
}
