//! Archive packing strategies.
//!
//! Strategies are tried in order until one produces an archive that passes
//! [`validate_archive`]. The in-process writer comes first; the system `zip`
//! tool is the fallback when it is installed.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::CompressionMethod;

use super::ArchiveError;

/// Leading signatures accepted as a zip archive.
///
/// Local file header, central directory header, end of central directory
/// (empty archive) and the spanning marker.
pub const ZIP_SIGNATURES: [[u8; 4]; 4] = [
    [0x50, 0x4b, 0x03, 0x04],
    [0x50, 0x4b, 0x01, 0x02],
    [0x50, 0x4b, 0x05, 0x06],
    [0x50, 0x4b, 0x07, 0x08],
];

/// Packs a directory's contents into a zip file.
///
/// Entries are stored relative to `source`, so the directory itself is not a
/// path component inside the archive.
pub trait ArchiveStrategy: Send + Sync {
    /// Short name used in logs and failure diagnostics.
    fn name(&self) -> &'static str;

    /// Write an archive of `source` to `dest`.
    fn pack(&self, source: &Path, dest: &Path) -> Result<(), ArchiveError>;
}

/// Check that `path` is a nonempty file starting with a zip signature.
///
/// Returns the archive size.
pub fn validate_archive(path: &Path) -> Result<u64, ArchiveError> {
    let size = fs::metadata(path)?.len();
    if size == 0 {
        return Err(ArchiveError::Invalid("archive is empty".to_string()));
    }

    let mut magic = [0u8; 4];
    File::open(path)?
        .read_exact(&mut magic)
        .map_err(|_| ArchiveError::Invalid(format!("archive is only {size} bytes")))?;
    if !ZIP_SIGNATURES.contains(&magic) {
        return Err(ArchiveError::Invalid(format!(
            "unexpected signature {}",
            hex::encode(magic)
        )));
    }
    Ok(size)
}

/// Archive entry name: `/`-joined components relative to the source.
fn entry_name(source: &Path, path: &Path) -> Result<String, ArchiveError> {
    let relative = path
        .strip_prefix(source)
        .map_err(|_| ArchiveError::Pack(format!("{} is outside the source", path.display())))?;
    let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
    parts
        .map(|p| p.join("/"))
        .ok_or_else(|| ArchiveError::Pack(format!("non UTF-8 path {}", path.display())))
}

/// In-process writer built on the `zip` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipLibraryStrategy;

impl ArchiveStrategy for ZipLibraryStrategy {
    fn name(&self) -> &'static str {
        "zip-library"
    }

    fn pack(&self, source: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let file = File::create(dest)?;
        let mut writer = zip::ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // Symlinks are not followed, so nothing outside the source is read.
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Pack(e.to_string()))?;
            let name = entry_name(source, entry.path())?;

            if entry.file_type().is_dir() {
                writer
                    .add_directory(format!("{name}/"), options.unix_permissions(0o755))
                    .map_err(|e| ArchiveError::Pack(e.to_string()))?;
            } else if entry.file_type().is_file() {
                let size = entry
                    .metadata()
                    .map_err(|e| ArchiveError::Pack(e.to_string()))?
                    .len();
                writer
                    .start_file(name, options.large_file(size >= u64::from(u32::MAX)))
                    .map_err(|e| ArchiveError::Pack(e.to_string()))?;
                let mut input = File::open(entry.path())?;
                io::copy(&mut input, &mut writer)?;
            } else {
                tracing::debug!("Skipping {:?} while archiving", entry.path());
            }
        }

        let mut inner = writer
            .finish()
            .map_err(|e| ArchiveError::Pack(e.to_string()))?;
        inner.flush()?;
        Ok(())
    }
}

/// The system `zip` program.
#[derive(Debug, Clone)]
pub struct ExternalZipStrategy {
    program: PathBuf,
}

impl ExternalZipStrategy {
    /// Use a specific program.
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Find `zip` on `PATH`.
    pub fn detect() -> Option<Self> {
        which::which("zip").ok().map(Self::new)
    }
}

impl ArchiveStrategy for ExternalZipStrategy {
    fn name(&self) -> &'static str {
        "external-zip"
    }

    fn pack(&self, source: &Path, dest: &Path) -> Result<(), ArchiveError> {
        // zip appends to an existing archive; start clean.
        match fs::remove_file(dest) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        // -y stores symlinks as links so their targets never enter the archive.
        let output = Command::new(&self.program)
            .arg("-r")
            .arg("-q")
            .arg("-y")
            .arg(dest)
            .arg(".")
            .current_dir(source)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArchiveError::Pack(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
