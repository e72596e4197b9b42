//! PID file marking a serving daemon.
//!
//! `start` writes `<data_dir>/lanshare.pid` and `stop` removes it. Offline
//! maintenance commands such as `sweep` check it first, so the metadata
//! snapshot never has two writers.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Holds the PID file for as long as it lives.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record this process at `path`.
    ///
    /// Fails when the file names another live process. A stale file is
    /// replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(pid) = running_pid(&path) {
            anyhow::bail!("LanShare daemon already running with PID {}", pid);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create PID file directory: {}", parent.display()))?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;
        tracing::debug!("Wrote PID file {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

/// PID of the daemon recorded at `path`, if that process is alive.
///
/// Unparsable or stale files are removed.
pub fn running_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            cleanup_stale_pid_file(path);
            None
        }
    }
}

/// Fail when a daemon is serving from the PID file at `path`.
pub fn ensure_not_running(path: &Path) -> Result<()> {
    match running_pid(path) {
        Some(pid) => anyhow::bail!(
            "LanShare daemon is running with PID {}; it sweeps on its own schedule, stop it first",
            pid
        ),
        None => Ok(()),
    }
}

/// Whether a process with this PID exists.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Out-of-range values would address a process group.
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed stale PID file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale PID file"),
    }
}
