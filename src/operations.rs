//! Filesystem operations on module trees (backup, restore, copy, delete).
//!
//! - Backup: copy a module root to a fresh timestamped snapshot directory
//! - Restore: replace whatever sits at a module root with a snapshot
//! - Discard: best-effort removal of a snapshot
//!
//! Backups are all-or-nothing. A copy that fails halfway removes what it wrote
//! and reports the error, since a partial snapshot cannot be restored from.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Creates and restores full-copy snapshots of module directories.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy `module_root` into `<backup_dir>/<name>_<timestamp>`.
    pub fn backup(&self, module_root: &Path) -> Result<PathBuf> {
        if !module_root.is_dir() {
            bail!("Module directory does not exist: {:?}", module_root);
        }

        let name = module_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("Invalid module directory name")?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
        let mut snapshot = self.backup_dir.join(format!("{}_{}", name, timestamp));
        let mut suffix = 1;
        while snapshot.exists() {
            snapshot = self
                .backup_dir
                .join(format!("{}_{}_{}", name, timestamp, suffix));
            suffix += 1;
        }

        fs::create_dir_all(&self.backup_dir)
            .context(format!("Failed to create backup directory: {:?}", self.backup_dir))?;

        if let Err(e) = copy_directory_recursive(module_root, &snapshot) {
            // Never leave a snapshot behind that nobody can trust.
            let _ = delete_path(&snapshot);
            return Err(e.context(format!("Failed to back up {:?}", module_root)));
        }

        info!(module = %name, snapshot = ?snapshot, "Module backed up");
        Ok(snapshot)
    }

    /// Replace the contents of `module_root` with `snapshot`.
    pub fn restore(&self, module_root: &Path, snapshot: &Path) -> Result<()> {
        if !snapshot.is_dir() {
            bail!("Backup does not exist: {:?}", snapshot);
        }

        delete_path(module_root)?;
        copy_directory_recursive(snapshot, module_root)
            .context(format!("Failed to restore {:?} from {:?}", module_root, snapshot))?;

        info!(root = ?module_root, snapshot = ?snapshot, "Module restored from backup");
        Ok(())
    }

    /// Remove a snapshot. Failures are logged only.
    pub fn discard(&self, snapshot: &Path) {
        match delete_path(snapshot) {
            Ok(()) => debug!(snapshot = ?snapshot, "Backup discarded"),
            Err(e) => warn!(snapshot = ?snapshot, error = %e, "Failed to discard backup"),
        }
    }
}

/// Recursively copy a directory. Symbolic links are copied as links, never
/// followed.
pub fn copy_directory_recursive(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).context(format!("Failed to create directory: {:?}", dest))?;

    for entry in fs::read_dir(source).context(format!("Failed to read directory: {:?}", source))? {
        let entry = entry?;
        let path = entry.path();
        let dest_path = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .context(format!("Failed to read file type: {:?}", path))?;

        if file_type.is_symlink() {
            copy_symlink(&path, &dest_path)?;
        } else if file_type.is_dir() {
            copy_directory_recursive(&path, &dest_path)?;
        } else {
            fs::copy(&path, &dest_path)
                .context(format!("Failed to copy {:?} to {:?}", path, dest_path))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(link).context(format!("Failed to read link: {:?}", link))?;
    std::os::unix::fs::symlink(&target, dest)
        .context(format!("Failed to create link {:?} -> {:?}", dest, target))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _dest: &Path) -> Result<()> {
    bail!("Symbolic links are not supported here: {:?}", link)
}

/// Replace `path` with `contents` via a temporary file and a rename, so
/// readers see either the old or the new file and never a torn write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).context(format!("Failed to create directory: {:?}", dir))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .context(format!("Failed to create temporary file in {:?}", dir))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .context(format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Delete a file or directory. Missing paths are not an error; a symbolic
/// link is removed without touching its target.
pub fn delete_path(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path).context(format!("Failed to remove directory: {:?}", path))?;
    } else {
        fs::remove_file(path).context(format!("Failed to remove file: {:?}", path))?;
    }

    Ok(())
}
