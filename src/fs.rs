//! Filesystem helpers for chunk files.
//!
//! New chunk files are materialised as a sibling temp file that is fully
//! written, synced, and atomically renamed into place; `TempFileGuard`
//! removes the temp file on every failure path before the rename commits.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// Builds the sibling temp path `{path}.{uuid}.tmp` for a chunk file.
pub fn chunk_temp_path(target: &Path) -> PathBuf {
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chunk".to_string());
    target.with_file_name(format!("{}.{}.tmp", base, Uuid::new_v4()))
}

/// Creates a new file preallocated to exactly `size` bytes.
pub fn create_fixed_size_file(path: &Path, size: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

/// Syncs a directory so a rename within it survives a crash.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()
}

/// Toggles the read-only attribute on a chunk file.
pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let metadata = fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    permissions.set_readonly(read_only);
    fs::set_permissions(path, permissions)
}

/// Removes a not-yet-renamed temp file unless the rename committed.
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks the temp file as renamed into place; the guard stops tracking it.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove temp chunk file");
            }
        }
    }
}
