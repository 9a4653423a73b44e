//! Atomic file write helpers.
//!
//! Content goes to a temp file in the destination directory, which is then
//! renamed over the target, so readers see either the old bytes or the new
//! bytes and never a partial write.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Let the file take the temp file's default permissions.
    #[default]
    Default,
    /// Apply an explicit Unix mode, typically the one the file had before.
    ///
    /// Ignored on non-Unix platforms.
    Preserve(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncPolicy {
    SyncAll,
    SkipSync,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    /// File sync policy for the temp file before persisting.
    pub file_sync: FileSyncPolicy,
    pub mode: PersistMode,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            file_sync: FileSyncPolicy::SyncAll,
            mode: PersistMode::Default,
        }
    }
}

impl AtomicWriteOptions {
    /// Options that keep the permission bits of `existing`, when they can be read.
    #[must_use]
    pub fn preserving(existing: &fs::Metadata) -> Self {
        Self {
            mode: mode_of(existing),
            ..Self::default()
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> PersistMode {
    use std::os::unix::fs::PermissionsExt;
    PersistMode::Preserve(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> PersistMode {
    PersistMode::Default
}

/// Replace `path` with `bytes`, creating it if absent.
pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = staged(path, bytes, options)?;

    if let Err(err) = tmp.persist(path) {
        if !path.exists() {
            return Err(err.error);
        }
        // Rename-over-existing fails on some platforms; move the old file aside first.
        let backup = path.with_extension("bak");
        let _ = fs::remove_file(&backup);
        fs::rename(path, &backup)?;
        if let Err(retry) = err.file.persist(path) {
            restore_backup(&backup, path);
            return Err(retry.error);
        }
        if let Err(e) = fs::remove_file(&backup) {
            tracing::warn!(path = %backup.display(), "Failed to remove backup after atomic write: {e}");
        }
    }

    debug!(path = %path.display(), bytes = bytes.len(), "Atomic write complete");
    Ok(())
}

/// Move `backup` back to `path`. Returns false if the original is stranded at `backup`.
fn restore_backup(backup: &Path, path: &Path) -> bool {
    match fs::rename(backup, path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                backup = %backup.display(),
                "Failed to restore original after atomic write: {e}"
            );
            false
        }
    }
}

/// Write `bytes` to `path`, failing with `AlreadyExists` if it is present.
pub fn atomic_write_new(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = staged(path, bytes, options)?;
    tmp.persist_noclobber(path).map_err(|err| err.error)?;
    debug!(path = %path.display(), bytes = bytes.len(), "Atomic create complete");
    Ok(())
}

fn staged(path: &Path, bytes: &[u8], options: AtomicWriteOptions) -> io::Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    apply_mode(tmp.path(), options.mode)?;
    tmp.write_all(bytes)?;
    if matches!(options.file_sync, FileSyncPolicy::SyncAll) {
        tmp.as_file().sync_all()?;
    }
    Ok(tmp)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: PersistMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        PersistMode::Default => Ok(()),
        PersistMode::Preserve(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: PersistMode) -> io::Result<()> {
    Ok(())
}
